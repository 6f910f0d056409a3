//! HTTP JSON API.
//!
//! One [`App`] serves every user; each user gets at most one live
//! [`Session`], created on their first chat message and dropped by
//! `DELETE /users/{user}/messages`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/users/{user}/documents` | The user's documents with indexed/pending status |
//! | `POST`   | `/users/{user}/documents?name=<file>` | Upload a PDF (raw body) |
//! | `POST`   | `/users/{user}/reconcile` | Index every pending document |
//! | `POST`   | `/users/{user}/chat` | `{message, documents}` → assistant turn |
//! | `GET`    | `/users/{user}/messages` | Conversation so far |
//! | `DELETE` | `/users/{user}/messages` | End the conversation |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "empty_selection", "message": "no documents selected; select at least one document" } }
//! ```
//!
//! Error codes: `bad_request` (400), `empty_selection` (400), `not_found` (404),
//! `pending` (409), `session_busy` (409), `registry_conflict` (409),
//! `extract_failed` (422), `completion_failed` (502), `internal` (500).
//!
//! A failed completion also carries `"prompt"` inside `error` so the client
//! can offer to resend it.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::{App, DocumentStatus};
use crate::error::Error;
use crate::extract::{content_type_for, MIME_PDF};
use crate::indexer::ReconcileReport;
use crate::models::{ConversationTurn, DocumentId};
use crate::session::{Session, SessionState};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    app: Arc<App>,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl AppState {
    fn session(&self, user: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(self.app.session(user)))
            .clone()
    }

    fn existing_session(&self, user: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(user).cloned()
    }

    /// Clear and forget the user's session in one critical section, so a
    /// chat request cannot pick it up between the two.
    ///
    /// Fails with [`Error::SessionBusy`] while a reply is in flight; the
    /// session is then kept.
    fn end_session(&self, user: &str) -> Result<(), Error> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(user) {
            session.clear()?;
            sessions.remove(user);
        }
        Ok(())
    }
}

/// Build the router over a shared [`App`].
pub fn router(app: Arc<App>) -> Router {
    let state = AppState {
        app,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/users/{user}/documents",
            get(handle_list_documents).post(handle_upload),
        )
        .route("/users/{user}/reconcile", post(handle_reconcile))
        .route("/users/{user}/chat", post(handle_chat))
        .route(
            "/users/{user}/messages",
            get(handle_messages).delete(handle_end_session),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    println!("docchat server listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    prompt: Option<String>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            prompt: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                prompt: self.prompt,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, "not_found", message),
            Error::EmptySelection => {
                AppError::new(StatusCode::BAD_REQUEST, "empty_selection", message)
            }
            Error::NotIndexed { .. } => AppError::new(StatusCode::CONFLICT, "pending", message),
            Error::SessionBusy => AppError::new(StatusCode::CONFLICT, "session_busy", message),
            Error::RegistryWriteConflict { .. } => {
                AppError::new(StatusCode::CONFLICT, "registry_conflict", message)
            }
            Error::Extract(_) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "extract_failed", message)
            }
            Error::Completion { prompt, .. } => AppError {
                prompt: Some(prompt),
                ..AppError::new(StatusCode::BAD_GATEWAY, "completion_failed", message)
            },
            Error::UnknownDocument { .. }
            | Error::Io { .. }
            | Error::Json(_) => {
                error!(error = %message, "request failed");
                internal(message)
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<DocumentStatus>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<DocumentsResponse>, AppError> {
    let documents = state.app.documents(&user).await?;
    Ok(Json(DocumentsResponse { documents }))
}

#[derive(Deserialize)]
struct UploadQuery {
    name: String,
}

#[derive(Serialize)]
struct UploadResponse {
    id: DocumentId,
    title: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let name = query.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    if content_type_for(&name) != Some(MIME_PDF) {
        return Err(bad_request(format!("{}: only PDF uploads are supported", name)));
    }
    if body.is_empty() {
        return Err(bad_request("request body must contain the PDF bytes"));
    }

    // Extraction is CPU-bound.
    let app = state.app.clone();
    let id = tokio::task::spawn_blocking(move || app.upload_pdf(&user, &name, &body))
        .await
        .map_err(|e| internal(format!("upload task failed: {}", e)))??;

    let title = state.app.store().title(&id)?;
    Ok((StatusCode::CREATED, Json(UploadResponse { id, title })))
}

async fn handle_reconcile(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<ReconcileReport>, AppError> {
    let report = state.app.reconcile(&user).await?;
    Ok(Json(report))
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    documents: Vec<DocumentId>,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: ConversationTurn,
}

async fn handle_chat(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let scope = state.app.scope(&user, &request.documents).await?;
    let session = state.session(&user);
    let reply = session.submit(request.message, &scope).await?;
    Ok(Json(ChatResponse { reply }))
}

#[derive(Serialize)]
struct MessagesResponse {
    state: SessionState,
    messages: Vec<ConversationTurn>,
}

async fn handle_messages(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<MessagesResponse> {
    let response = match state.existing_session(&user) {
        Some(session) => MessagesResponse {
            state: session.state(),
            messages: session.turns(),
        },
        None => MessagesResponse {
            state: SessionState::Idle,
            messages: Vec::new(),
        },
    };
    Json(response)
}

async fn handle_end_session(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<StatusCode, AppError> {
    state.end_session(&user)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatService, ModelParams};
    use crate::config::Config;
    use crate::embedding::HashEmbedder;
    use crate::index::InMemoryVectorIndex;
    use crate::scope::RetrievalScope;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct Gated {
        release: Notify,
    }

    #[async_trait]
    impl ChatService for Gated {
        async fn chat(
            &self,
            _namespace: &str,
            _turns: &[ConversationTurn],
            _scope: &RetrievalScope,
            _params: &ModelParams,
        ) -> anyhow::Result<String> {
            self.release.notified().await;
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn busy_session_is_not_ended() {
        let tmp = TempDir::new().unwrap();
        let gated = Arc::new(Gated {
            release: Notify::new(),
        });
        let index = Arc::new(InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(32))));
        let app = App::new(Config::local(tmp.path()), index, gated.clone()).unwrap();
        let state = AppState {
            app: Arc::new(app),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        };

        let session = state.session("alice");
        let scope = RetrievalScope::from_titles(["Minutes.pdf"]).unwrap();
        let in_flight = {
            let session = session.clone();
            tokio::spawn(async move { session.submit("hello", &scope).await })
        };
        while session.state() != SessionState::AwaitingReply {
            tokio::task::yield_now().await;
        }

        assert!(matches!(state.end_session("alice"), Err(Error::SessionBusy)));
        let kept = state.existing_session("alice").unwrap();
        assert!(Arc::ptr_eq(&kept, &session));

        gated.release.notify_one();
        in_flight.await.unwrap().unwrap();
        assert_eq!(kept.turns().len(), 2);

        state.end_session("alice").unwrap();
        assert!(state.existing_session("alice").is_none());
        assert!(state.session("alice").turns().is_empty());
    }
}
