//! HTTP Surface (C12): the caller API.
//!
//! - `GET /api/status` - backend reachability / loaded-model summary
//! - `POST /api/conversations` - create a conversation
//! - `GET /api/conversations` - list active conversations
//! - `GET /api/conversations/:id` - fetch a conversation
//! - `DELETE /api/conversations/:id` - soft delete
//! - `POST /api/conversations/:id/restore` - restore a soft-deleted conversation
//! - `DELETE /api/conversations/:id/purge` - permanently delete
//! - `POST /api/conversations/:id/messages` - submit a message; SSE deliberation
//!   stream by default, or `?stream=false` for a blocking JSON `DeliberationRecord`
//! - `GET /api/titles/subscribe` - SSE subscription to title-generation progress

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Settings;
use crate::controller::Controller;
use crate::conversation::{is_generic_title, Conversation, Message, Role};
use crate::errors::CouncilError;
use crate::events::new_channel;
use crate::model_client::ModelClient;
use crate::persistence::PersistenceAdapter;
use crate::push_broker::PushBroker;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub controller: Arc<Controller>,
    pub broker: PushBroker,
    pub client: Arc<ModelClient>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/conversations", post(create_conversation_handler).get(list_conversations_handler))
        .route("/api/conversations/:id", get(get_conversation_handler).delete(delete_conversation_handler))
        .route("/api/conversations/:id/restore", post(restore_conversation_handler))
        .route("/api/conversations/:id/purge", delete(hard_delete_handler))
        .route("/api/conversations/:id/messages", post(submit_message_handler))
        .route("/api/titles/subscribe", get(title_subscribe_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.settings.ip_address, state.settings.port);
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "council HTTP surface listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    backend_reachable: bool,
    loaded_model_count: usize,
    council: Vec<String>,
    chairman: String,
}

/// §4.12: reports backend reachability and loaded-model counts alongside
/// the configured council/chairman, so a caller can tell "not loaded" apart
/// from "backend unreachable" without hitting the deliberation endpoint.
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let endpoint = state.settings.resolve_endpoint(&state.settings.deliberation.chairman);
    let (backend_reachable, loaded_model_count) = match state
        .client
        .list_models(&endpoint.base_url, endpoint.api_key.as_deref())
        .await
    {
        Ok(models) => (true, models.len()),
        Err(_) => (false, 0),
    };

    Json(StatusResponse {
        status: "ok",
        backend_reachable,
        loaded_model_count,
        council: state.settings.deliberation.council_members.clone(),
        chairman: state.settings.deliberation.chairman.clone(),
    })
}

async fn create_conversation_handler(State(state): State<AppState>) -> Result<Json<Conversation>, ApiError> {
    let conv = state.persistence.create_conversation().await?;
    Ok(Json(conv))
}

async fn list_conversations_handler(State(state): State<AppState>) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.persistence.list_active().await?))
}

async fn get_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.persistence.get(id).await?))
}

async fn delete_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.persistence.soft_delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.persistence.restore(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn hard_delete_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.persistence.hard_delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SubmitMessageRequest {
    content: String,
}

/// `?stream=false` (default `true`) selects blocking mode: the handler
/// awaits the full deliberation and returns the final `DeliberationRecord`
/// as JSON instead of an SSE token stream (§4.12).
#[derive(Deserialize)]
struct SubmitMessageQuery {
    #[serde(default = "default_stream_mode")]
    stream: bool,
}

fn default_stream_mode() -> bool {
    true
}

async fn submit_message_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(mode): Query<SubmitMessageQuery>,
    Json(req): Json<SubmitMessageRequest>,
) -> Result<Response, ApiError> {
    let conversation = state.persistence.get(id).await?;
    // §4.7: a title job is only enqueued when this is the first user message
    // AND the conversation's title is still in placeholder form (a user may
    // have renamed it manually before sending anything further).
    let is_first_message = is_generic_title(&conversation.title)
        && conversation.messages.iter().all(|m| m.role != Role::User);

    state
        .persistence
        .append_message(id, Message::user(req.content.clone()))
        .await?;

    let config = state.settings.deliberation.clone();
    let controller = Arc::clone(&state.controller);
    let query = req.content;

    if !mode.stream {
        let cancel = CancellationToken::new();
        let (sender, mut rx) = new_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let record = controller
            .run(id, query, config, sender, cancel, is_first_message)
            .await?;
        return Ok(Json(record).into_response());
    }

    let (sender, mut rx) = new_channel();
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        let _ = controller
            .run(id, query, config, sender, cancel, is_first_message)
            .await;
    });

    let stream = async_stream::stream! {
        while let Some(envelope) = rx.recv().await {
            let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
            yield Ok(Event::default().data(data));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

async fn title_subscribe_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.broker.subscribe().await;
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            yield Ok(Event::default().data(data));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

struct ApiError(CouncilError);

impl From<CouncilError> for ApiError {
    fn from(e: CouncilError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            CouncilError::NotFound(_) => StatusCode::NOT_FOUND,
            CouncilError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.kind_str(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_maps_not_found_to_404() {
        let err: ApiError = CouncilError::NotFound("x".to_string()).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
