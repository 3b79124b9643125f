//! Read-only views of live sessions.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.registry.snapshots();
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max": state.config.performance.max_concurrent_sessions,
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{session_id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))?;
    Ok(HttpResponse::Ok().json(session.snapshot()))
}
