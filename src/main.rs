//! # Live Transcriber - Main Application Entry Point
//!
//! WebSocket server that turns live PCM audio streams into ordered transcript
//! events using a locally loaded Whisper model.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, `APP_` environment variables)
//! - **state**: Shared handles to the config, engine pool and session registry
//! - **audio**: Frame validation and the per-session accumulation buffer
//! - **transcription**: Engine traits, the engine pool and the Whisper implementation
//! - **session**: Queues, worker, sender, watchdogs and the session lifecycle
//! - **websocket**: The actix WebSocket actor that feeds a session
//! - **health** / **handlers**: Operational HTTP endpoints
//! - **error**: Error types and HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod session;
mod state;
mod transcription;
mod websocket;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use device::DevicePreference;
use state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{EnginePool, ModelSize, WhisperLoader};

/// Startup order:
/// 1. Load and validate configuration
/// 2. Load the speech engine (fatal on failure)
/// 3. Start the model-health watchdog
/// 4. Serve HTTP and WebSocket traffic until a shutdown signal
/// 5. Drain every live session, then stop the server and the watchdog
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let size: ModelSize = config.models.whisper_model.parse()?;
    let loader = WhisperLoader::new(
        size,
        DevicePreference::from_config(&config.models.device),
        config.language_hint(),
    );
    let engine = Arc::new(EnginePool::new(Arc::new(loader), config.models.instances));
    engine.load().await?;

    let watchdog_stop = CancellationToken::new();
    let watchdog = session::watchdog::spawn_model_watchdog(
        Arc::clone(&engine),
        &config.watchdog,
        watchdog_stop.clone(),
    );

    let app_state = AppState::new(config.clone(), engine);
    let registry = Arc::clone(&app_state.registry);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session))
                    .route("/engine", web::get().to(handlers::engine_status))
                    .route("/engine/reload", web::post().to(handlers::reload_engine)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::audio_websocket))
            .route("/ws/{session_id}", web::get().to(websocket::audio_websocket_with_id))
            .route("/", web::get().to(websocket::audio_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = wait_for_shutdown() => {
            if let Err(e) = signal {
                error!("Signal handling failed: {}", e);
            }
            info!(sessions = registry.len(), "Shutdown signal received, draining sessions...");
            let budget = config.session.drain_timeout() + config.session.sender_grace();
            registry.close_all(budget).await;
            server_handle.stop(true).await;
        }
    }

    watchdog_stop.cancel();
    if let Err(e) = watchdog.await {
        error!("Model watchdog task failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; defaults to `live_transcriber=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_transcriber=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT");
        }
    }
    Ok(())
}
