//! Streams one answer to stdout as the fragments arrive.
//!
//! Run with: cargo run --example stream_chat -- "What is the golden ratio?"

use foundry_session::{RunOptions, ServiceConfig, ServiceManager, Session};
use futures::StreamExt;
use std::io::Write;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What is the golden ratio?".to_string());

    let manager = ServiceManager::new(ServiceConfig::load()?)?;
    let mut session =
        Session::connect(&manager, "qwen2.5-0.5b", "You are a helpful AI assistant.").await?;
    println!("Model info: {}", session.model().map(|m| m.id()).unwrap_or("unknown"));

    let mut stream = session.run_stream(&prompt, &RunOptions::default()).await?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = stream.next().await {
        write!(stdout, "{}", fragment?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    session.close();
    Ok(())
}
