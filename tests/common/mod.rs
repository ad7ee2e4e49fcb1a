//! In-process stub of a local OpenAI-compatible service for integration tests.
#![allow(dead_code)]

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use foundry_session::protocol::{
    ApiErrorBody, ApiErrorDetail, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, Choice, ChoiceChunk, Delta, ModelObject, ModelsListResponse,
    ResponseMessage, Role,
};
use foundry_session::ServiceConfig;
use futures::stream::{self, StreamExt};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub const QWEN_ID: &str = "qwen2.5-0.5b-instruct-generic-cpu:3";
pub const PHI_ID: &str = "phi-3.5-mini-instruct-generic-cpu:1";

/// What the stub answers on `/v1/chat/completions`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream these deltas (`None` is a chunk without content), then `[DONE]`.
    Chunks(Vec<Option<String>>),
    /// Reject with this status and an OpenAI-style error body.
    Status(u16, String),
    /// One valid chunk followed by a frame that is not JSON.
    Malformed,
    /// One valid chunk, then keep the connection open forever.
    Hang,
}

impl Reply {
    pub fn chunks(parts: &[Option<&str>]) -> Self {
        Reply::Chunks(parts.iter().map(|p| p.map(str::to_string)).collect())
    }
}

#[derive(Clone)]
struct StubState {
    models: Arc<Vec<String>>,
    reply: Arc<Reply>,
    requests: Arc<Mutex<Vec<ChatCompletionRequest>>>,
    auth_headers: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct StubService {
    pub base_url: String,
    state: StubState,
    handle: JoinHandle<()>,
}

impl StubService {
    pub async fn start(models: &[&str], reply: Reply) -> Self {
        let state = StubState {
            models: Arc::new(models.iter().map(|m| m.to_string()).collect()),
            reply: Arc::new(reply),
            requests: Arc::new(Mutex::new(Vec::new())),
            auth_headers: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/models", get(list_models))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}/v1", addr),
            state,
            handle,
        }
    }

    pub fn config(&self) -> ServiceConfig {
        ServiceConfig::new(self.base_url.clone())
    }

    /// Chat requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.state.auth_headers.lock().unwrap().clone()
    }
}

impl Drop for StubService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn list_models(State(state): State<StubState>) -> Json<ModelsListResponse> {
    Json(ModelsListResponse {
        object: "list".to_string(),
        data: state
            .models
            .iter()
            .map(|id| ModelObject {
                id: id.clone(),
                object: "model".to_string(),
                created: 1_700_000_000,
                owned_by: "stub".to_string(),
            })
            .collect(),
    })
}

fn chunk(model: &str, delta: Delta, finish_reason: Option<&str>) -> Event {
    let chunk = ChatCompletionChunk {
        id: "chatcmpl-stub".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 1_700_000_000,
        model: model.to_string(),
        choices: vec![ChoiceChunk {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }],
    };
    Event::default().data(serde_json::to_string(&chunk).unwrap())
}

fn content(text: Option<String>) -> Delta {
    Delta {
        role: None,
        content: text,
    }
}

async fn chat_completions(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    state.auth_headers.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    state.requests.lock().unwrap().push(req.clone());

    let model = req.model.clone();
    let opening = chunk(
        &model,
        Delta {
            role: Some(Role::Assistant),
            content: None,
        },
        None,
    );

    match state.reply.as_ref() {
        Reply::Status(status, message) => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = ApiErrorBody {
                error: ApiErrorDetail {
                    message: message.clone(),
                    kind: Some("server_error".to_string()),
                    code: None,
                },
            };
            (status, Json(body)).into_response()
        }
        Reply::Chunks(parts) if !req.stream => {
            let text: String = parts.iter().flatten().map(String::as_str).collect();
            Json(ChatCompletionResponse {
                id: "chatcmpl-stub".to_string(),
                object: "chat.completion".to_string(),
                created: 1_700_000_000,
                model,
                choices: vec![Choice {
                    index: 0,
                    message: ResponseMessage {
                        role: Role::Assistant,
                        content: Some(text),
                    },
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
            })
            .into_response()
        }
        Reply::Chunks(parts) => {
            let mut events = vec![opening];
            events.extend(parts.iter().map(|p| chunk(&model, content(p.clone()), None)));
            events.push(chunk(&model, Delta::default(), Some("stop")));
            events.push(Event::default().data("[DONE]"));
            Sse::new(stream::iter(events.into_iter().map(Ok::<Event, Infallible>))).into_response()
        }
        Reply::Malformed => {
            let events = vec![
                opening,
                chunk(&model, content(Some("partial".to_string())), None),
                Event::default().data("{not json"),
            ];
            Sse::new(stream::iter(events.into_iter().map(Ok::<Event, Infallible>))).into_response()
        }
        Reply::Hang => {
            let events = vec![opening, chunk(&model, content(Some("thinking".to_string())), None)];
            let endless = stream::iter(events.into_iter().map(Ok::<Event, Infallible>))
                .chain(stream::pending());
            Sse::new(endless).into_response()
        }
    }
}
