use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::{Result, SessionError};
use crate::protocol::{
    ApiErrorBody, ChatCompletionRequest, ChatCompletionResponse, Message, ModelObject,
    ModelsListResponse,
};
use crate::stream::{decode_sse, text_fragments, FragmentStream};

/// HTTP client bound to one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        if let Some(bearer) = config.bearer() {
            let mut value = HeaderValue::from_str(&bearer)
                .map_err(|_| SessionError::Config("api key contains invalid characters".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.request_timeout())
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {endpoint}/models`
    pub async fn list_models(&self) -> Result<Vec<ModelObject>> {
        let url = format!("{}/models", self.base_url);
        tracing::debug!(url = %url, "Listing served models");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::unavailable(&self.base_url, e))?;
        let response = check_status(response).await?;

        let models: ModelsListResponse = response
            .json()
            .await
            .map_err(|e| SessionError::RequestFailed(format!("invalid models list: {}", e)))?;
        Ok(models.data)
    }

    /// Short liveness probe against the models endpoint.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let url = format!("{}/models", self.base_url);
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!(error = %e, url = %url, "Service probe failed");
                false
            }
        }
    }

    /// Streaming chat completion; yields non-empty text fragments in arrival order.
    pub async fn stream_chat(&self, mut request: ChatCompletionRequest) -> Result<FragmentStream> {
        request.stream = true;
        let response = self.post_chat(&request).await?;
        let fragments = text_fragments(decode_sse(Box::pin(response.bytes_stream())));
        Ok(fragments.boxed())
    }

    /// Non-streaming chat completion; returns the first choice's content.
    pub async fn complete(&self, mut request: ChatCompletionRequest) -> Result<String> {
        request.stream = false;
        let response = self.post_chat(&request).await?;
        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SessionError::RequestFailed(format!("invalid completion body: {}", e)))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::RequestFailed("completion has no choices".into()))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn post_chat(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(
            url = %url,
            model = %request.model,
            message_count = request.messages.len(),
            stream = request.stream,
            "Sending chat completion request"
        );

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| SessionError::RequestFailed(e.to_string()))?;
        check_status(response).await
    }
}

/// Builds the two-message exchange sent for every run.
pub fn build_request(model: &str, instructions: &str, prompt: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![Message::system(instructions), Message::user(prompt)],
        stream: true,
        max_tokens: None,
        temperature: None,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };

    tracing::warn!(status = status.as_u16(), message = %message, "Service rejected request");
    Err(SessionError::Api {
        status: status.as_u16(),
        message,
    })
}
