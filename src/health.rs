use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let engine = state.engine.stats();
    let available = state.engine.is_available();
    let active_sessions = state.registry.len();

    let status = if available { "healthy" } else { "degraded" };
    let engine_status = if engine.reloading {
        "reloading"
    } else if available {
        "loaded"
    } else {
        "not_loaded"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "engine": {
            "model": config.models.whisper_model,
            "description": engine.engine,
            "status": engine_status,
            "available": available,
            "loaded_instances": engine.loaded_instances,
            "configured_instances": engine.configured_instances
        },
        "sessions": {
            "active": active_sessions,
            "max": config.performance.max_concurrent_sessions
        },
        "memory": get_memory_info(),
        "system": get_system_status(&state)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let totals = state.registry.totals();
    let engine = state.engine.stats();
    let counters = &totals.counters;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "sessions": {
            "active": totals.active_sessions,
            "opened": totals.sessions_opened,
            "closed": totals.sessions_closed,
            "max": totals.max_sessions
        },
        "audio": {
            "bytes_received": counters.bytes_received,
            "frames_rejected": counters.frames_rejected,
            "chunks_enqueued": counters.chunks_enqueued,
            "chunks_dropped": counters.chunks_dropped
        },
        "transcription": {
            "transcriptions": counters.transcriptions,
            "duplicates_suppressed": counters.duplicates_suppressed,
            "engine_errors": counters.engine_errors,
            "events_sent": counters.events_sent
        },
        "engine": engine,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let (vm_rss, vm_size) = parse_proc_status(&status);
            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// `(VmRSS, VmSize)` in bytes from a `/proc/<pid>/status` body.
fn parse_proc_status(status: &str) -> (u64, u64) {
    let kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };

    let mut vm_rss = 0;
    let mut vm_size = 0;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            vm_rss = kb(line);
        } else if line.starts_with("VmSize:") {
            vm_size = kb(line);
        }
    }
    (vm_rss, vm_size)
}

fn get_system_status(state: &AppState) -> serde_json::Value {
    let session_usage = state.session_usage();

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
