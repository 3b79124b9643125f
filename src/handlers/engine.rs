//! Speech engine operations.
//!
//! - `GET /api/v1/engine`: pool status
//! - `POST /api/v1/engine/reload`: unload and reload every instance

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{info, warn};

pub async fn engine_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "available": state.engine.is_available(),
        "engine": state.engine.stats()
    })))
}

/// Operator-triggered reload. Sessions see `Unavailable` errors until it finishes.
pub async fn reload_engine(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let start_time = std::time::Instant::now();
    info!("Speech engine reload requested");

    if let Err(e) = state.engine.reload().await {
        warn!("Requested reload failed: {}", e);
        return Err(AppError::Unavailable(e.to_string()));
    }

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Speech engine reloaded",
        "reload_time_ms": start_time.elapsed().as_millis() as u64,
        "engine": state.engine.stats()
    })))
}
