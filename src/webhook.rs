//! HTTP endpoints: the Telegram webhook, a transport-neutral event API and a
//! health probe.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};

use crate::channels::update::{MappedUpdate, Update, map_update};
use crate::channels::{CourseChannelRegistry, MessageSink, TelegramClient, deliver_all};
use crate::flow::FlowEngine;
use crate::flow::input::InboundEvent;
use crate::flow::messages::OutboundMessage;

/// Header Telegram echoes the webhook secret in.
const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Shared state for bot routes.
#[derive(Clone)]
pub struct WebhookState {
    pub engine: Arc<FlowEngine>,
    pub sink: Arc<dyn MessageSink>,
    pub registry: Arc<CourseChannelRegistry>,
    /// Used to acknowledge button presses. `None` without a bot token.
    pub telegram: Option<Arc<TelegramClient>>,
    pub secret: Option<Arc<SecretString>>,
}

impl WebhookState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.secret else {
            return true;
        };
        headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|given| given == expected.expose_secret())
    }

    /// Deliver in the background; the HTTP response does not wait.
    fn dispatch(&self, messages: Vec<OutboundMessage>) {
        if messages.is_empty() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            deliver_all(sink.as_ref(), messages).await;
        });
    }
}

/// POST /telegram/webhook
///
/// Accepts a raw Telegram update. Once authenticated the answer is always
/// 200 so Telegram does not redeliver; failures are logged.
async fn telegram_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.authorized(&headers) {
        tracing::warn!("Rejected webhook call with a wrong secret token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!("Ignoring unreadable Telegram update: {}", e);
            return StatusCode::OK.into_response();
        }
    };

    let handled = match map_update(&update, &state.registry) {
        MappedUpdate::Event {
            event,
            callback_query_id,
        } => {
            if let (Some(id), Some(client)) = (callback_query_id, state.telegram.clone()) {
                tokio::spawn(async move {
                    if let Err(e) = client.answer_callback_query(&id).await {
                        tracing::debug!("answerCallbackQuery failed: {}", e);
                    }
                });
            }
            state.engine.handle_event(&event).await
        }
        MappedUpdate::CourseMembership { user_id } => {
            state.engine.handle_course_membership(user_id).await
        }
        MappedUpdate::Ignored => Ok(Vec::new()),
    };

    match handled {
        Ok(messages) => state.dispatch(messages),
        Err(e) => tracing::error!(update_id = update.update_id, "Failed to handle update: {}", e),
    }
    StatusCode::OK.into_response()
}

/// POST /api/bot/updates
///
/// Runs one transport-neutral event and returns the produced messages
/// instead of delivering them.
async fn post_event(State(state): State<WebhookState>, Json(event): Json<InboundEvent>) -> Response {
    match state.engine.handle_event(&event).await {
        Ok(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Err(e) => {
            tracing::error!(user_id = event.user_id, "Failed to handle event: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the bot's HTTP routes.
pub fn bot_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/telegram/webhook", post(telegram_webhook))
        .route("/api/bot/updates", post(post_event))
        .route("/health", get(health))
        .with_state(state)
}
