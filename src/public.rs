//! Public read-only endpoints about the children questions.
//!
//! A caller proves who they are with their user id and the phone number they
//! registered with. Unknown ids and mismatched phones both answer 404.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::model::{ReadingLevel, UserProfile};
use crate::store::Database;

/// Identity presented by a caller.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: i64,
    #[serde(default)]
    pub phone: String,
}

/// A caller's own children answers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildrenSelf {
    pub user_id: i64,
    pub has_children: Option<bool>,
    pub children_study_quran: Option<bool>,
    pub reading_level: Option<ReadingLevel>,
}

impl From<&UserProfile> for ChildrenSelf {
    fn from(p: &UserProfile) -> Self {
        Self {
            user_id: p.user_id,
            has_children: p.has_children,
            children_study_quran: p.children_study_quran,
            reading_level: p.reading_level,
        }
    }
}

fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// The profile behind `creds`, if the phone matches the stored one.
async fn authorize(db: &dyn Database, creds: &Credentials) -> Result<Option<UserProfile>, Response> {
    if creds.user_id <= 0 {
        return Ok(None);
    }
    let profile = db.get_profile(creds.user_id).await.map_err(|e| {
        tracing::error!(user_id = creds.user_id, "Failed to load profile: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })?;

    let given = digits(&creds.phone);
    Ok(profile.filter(|p| {
        !given.is_empty() && p.phone.as_deref().map(digits).as_deref() == Some(given.as_str())
    }))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

/// GET /api/public/children/stats?userId=&phone=
async fn children_stats(
    State(db): State<Arc<dyn Database>>,
    Query(creds): Query<Credentials>,
) -> Response {
    match authorize(db.as_ref(), &creds).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(response) => return response,
    }
    match db.children_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!("Failed to compute children stats: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// POST /api/public/children/self
async fn children_self(
    State(db): State<Arc<dyn Database>>,
    Json(creds): Json<Credentials>,
) -> Response {
    match authorize(db.as_ref(), &creds).await {
        Ok(Some(profile)) => Json(ChildrenSelf::from(&profile)).into_response(),
        Ok(None) => not_found(),
        Err(response) => response,
    }
}

/// Build the public routes.
pub fn public_routes(db: Arc<dyn Database>) -> Router {
    Router::new()
        .route("/api/public/children/stats", get(children_stats))
        .route("/api/public/children/self", post(children_self))
        .with_state(db)
}
