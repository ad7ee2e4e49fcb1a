//! foundry-session: a session facade over a local OpenAI-compatible inference service
//!
//! This library provides:
//! - Service discovery: attach to a running local service or spawn it
//! - Alias resolution against the service's model catalog
//! - Streamed and non-streamed chat completions with ordered reassembly
//! - A scoped session with explicit `Uninitialized -> Ready -> Closed` lifecycle
//!
//! # Example
//!
//! ```no_run
//! use foundry_session::{ServiceConfig, ServiceManager, Session, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = ServiceManager::new(ServiceConfig::load()?)?;
//!
//!     let instructions = "You are a helpful AI assistant.";
//!     let session = Session::connect(&manager, "qwen2.5-0.5b", instructions).await?;
//!     let result = session.run("What is the golden ratio?").await?;
//!     println!("{} ({})", result.text, result.metadata.resolved_model_id);
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod stream;

// Re-export main types for library users
pub use client::ChatClient;
pub use config::{LaunchMode, ServiceConfig, Transport};
pub use error::{Result, SessionError};
pub use manager::{ModelHandle, ServiceManager};
pub use session::{
    RunMetadata, RunOptions, RunResult, Session, SessionState, DEFAULT_INSTRUCTIONS,
};
pub use stream::FragmentStream;
