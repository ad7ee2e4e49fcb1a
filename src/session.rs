//! The session facade: one alias, one set of instructions, one call surface.
//!
//! A [`Session`] moves through `Uninitialized -> Ready -> Closed`. `open`
//! acquires the service and resolves the alias, `run` may be called any
//! number of times while ready, and `close` (or dropping the session)
//! releases the request client. Nothing leaves `Closed`.

use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{build_request, ChatClient};
use crate::error::{Result, SessionError};
use crate::manager::{ModelHandle, ServiceManager};
use crate::stream::{FragmentStream, Reassembler};

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful AI assistant.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-call knobs for [`Session::run_with`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Request a streamed completion and reassemble it (the default).
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stream: true,
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub alias: String,
    pub resolved_model_id: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub text: String,
    pub metadata: RunMetadata,
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    alias: String,
    instructions: String,
    state: SessionState,
    model: Option<ModelHandle>,
    client: Option<ChatClient>,
    source: String,
}

impl Session {
    pub fn new(alias: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alias: alias.into(),
            instructions: instructions.into(),
            state: SessionState::Uninitialized,
            model: None,
            client: None,
            source: String::new(),
        }
    }

    /// Creates and opens a session in one step.
    pub async fn connect(
        manager: &ServiceManager,
        alias: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Result<Self> {
        let mut session = Self::new(alias, instructions);
        session.open(manager).await?;
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The resolved model, available once the session has been opened.
    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    /// Acquires the service and resolves the alias.
    ///
    /// Whether the service is started or only located follows the manager's
    /// launch mode. On failure the session stays `Uninitialized`.
    pub async fn open(&mut self, manager: &ServiceManager) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }

        tracing::info!(session_id = %self.id, alias = %self.alias, "Opening session");

        manager.start_service().await?;
        let model = manager.resolve(&self.alias).await?;

        tracing::info!(
            session_id = %self.id,
            alias = %self.alias,
            model_id = %model,
            endpoint = %manager.endpoint(),
            "Session ready"
        );

        self.client = Some(manager.client());
        self.model = Some(model);
        self.source = manager.source().to_string();
        self.state = SessionState::Ready;
        Ok(())
    }

    fn ready_parts(&self, operation: &'static str) -> Result<(&ChatClient, &ModelHandle)> {
        match (self.state, &self.client, &self.model) {
            (SessionState::Ready, Some(client), Some(model)) => Ok((client, model)),
            (state, _, _) => Err(SessionError::InvalidState { operation, state }),
        }
    }

    fn metadata(&self, model: &ModelHandle) -> RunMetadata {
        RunMetadata {
            alias: self.alias.clone(),
            resolved_model_id: model.id().to_string(),
            source: self.source.clone(),
        }
    }

    /// Sends `prompt` as a streamed completion and returns the full answer.
    pub async fn run(&self, prompt: &str) -> Result<RunResult> {
        self.run_with(prompt, &RunOptions::default()).await
    }

    pub async fn run_with(&self, prompt: &str, options: &RunOptions) -> Result<RunResult> {
        let (client, model) = self.ready_parts("run")?;
        if prompt.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let mut request = build_request(model.id(), &self.instructions, prompt);
        request.max_tokens = options.max_tokens;
        request.temperature = options.temperature;

        tracing::debug!(
            session_id = %self.id,
            model_id = %model,
            stream = options.stream,
            prompt_length = prompt.len(),
            "Running prompt"
        );
        tracing::trace!(prompt = %prompt, "Prompt text");

        let text = if options.stream {
            self.collect_stream(client.stream_chat(request).await).await
        } else {
            client.complete(request).await.map(|text| text.trim().to_string())
        };

        let text = match text {
            Ok(text) if text.is_empty() => Err(SessionError::EmptyResponse),
            other => other,
        }
        .map_err(|e| {
            tracing::error!(session_id = %self.id, model_id = %model, error = %e, "Run failed");
            e
        })?;

        tracing::info!(
            session_id = %self.id,
            model_id = %model,
            response_length = text.len(),
            "Run complete"
        );
        tracing::trace!(response = %text, "Response text");

        Ok(RunResult {
            text,
            metadata: self.metadata(model),
        })
    }

    async fn collect_stream(&self, stream: Result<FragmentStream>) -> Result<String> {
        let mut stream = stream?;
        let mut answer = Reassembler::new();
        while let Some(fragment) = stream.next().await {
            answer.push(&fragment?);
        }
        tracing::debug!(session_id = %self.id, fragments = answer.fragments(), "Stream finished");
        Ok(answer.finish())
    }

    /// Streams the answer fragment by fragment instead of collecting it.
    ///
    /// Fragments are untrimmed and arrive in delivery order; empty deltas are
    /// already filtered out.
    pub async fn run_stream(&self, prompt: &str, options: &RunOptions) -> Result<FragmentStream> {
        let (client, model) = self.ready_parts("run")?;
        if prompt.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let mut request = build_request(model.id(), &self.instructions, prompt);
        request.max_tokens = options.max_tokens;
        request.temperature = options.temperature;

        tracing::debug!(session_id = %self.id, model_id = %model, "Streaming prompt");
        client.stream_chat(request).await
    }

    /// Like [`Session::run_with`], but aborts when `cancel` fires.
    ///
    /// A cancelled session is closed and cannot be used again.
    pub async fn run_cancellable(
        &mut self,
        prompt: &str,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        self.ready_parts("run")?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.run_with(prompt, options) => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                tracing::warn!(session_id = %self.id, "Run cancelled, closing session");
                self.close();
                Err(SessionError::Cancelled)
            }
        }
    }

    /// Releases the request client. Calling it again is a no-op.
    ///
    /// The local service itself keeps running.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            tracing::debug!(session_id = %self.id, "Session already closed");
            return;
        }
        self.client = None;
        self.state = SessionState::Closed;
        tracing::info!(session_id = %self.id, alias = %self.alias, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Ready {
            self.close();
        }
    }
}
