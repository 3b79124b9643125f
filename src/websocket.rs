//! # WebSocket Transport
//!
//! Bridges one actix WebSocket connection to one `Session`.
//!
//! ## Protocol:
//! 1. **Connection**: `GET /ws`, `GET /` or `GET /ws/{session_id}` upgrades the request
//! 2. **Start**: text frame `{"type":"start","meetingId":"…","speaker":"…"}`,
//!    answered with a `status` event
//! 3. **Audio**: binary frames of raw PCM16LE mono samples
//! 4. **End**: text frame `{"type":"end"}`; pending audio is transcribed, a
//!    final `status` event is sent and the server closes the socket
//!
//! Everything the server sends (transcripts, errors, keepalives and heartbeat
//! pings) goes through the session's ordered output queue, so the actor only
//! writes frames handed to it by the `ResultSender`.

use crate::error::{AppError, TransportError};
use crate::session::{EventSink, RegistryError, Session, SessionMeta, TranscriptEvent};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One serialized event, written as a text frame.
#[derive(Message)]
#[rtype(result = "()")]
struct DeliverEvent(String);

/// Close the socket normally and stop the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection;

/// `EventSink` backed by the connection actor's mailbox.
///
/// `send` waits for the actor to accept the frame, so a stopped actor shows up
/// as `TransportError::Closed` and events are written in call order.
pub struct WsSink {
    addr: Addr<AudioWebSocket>,
}

impl WsSink {
    pub fn new(addr: Addr<AudioWebSocket>) -> Self {
        Self { addr }
    }
}

fn encode_event(event: &TranscriptEvent) -> Result<String, TransportError> {
    serde_json::to_string(event).map_err(|e| TransportError::Encode(e.to_string()))
}

impl EventSink for WsSink {
    fn send(&self, event: TranscriptEvent) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let frame = encode_event(&event)?;
            self.addr
                .send(DeliverEvent(frame))
                .await
                .map_err(|_| TransportError::Closed)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.addr.connected() {
                self.addr.do_send(CloseConnection);
            }
        })
    }
}

/// Connection actor. Owns nothing but the link to its session.
pub struct AudioWebSocket {
    session_id: String,
    state: web::Data<AppState>,
    session: Option<Arc<Session>>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl AudioWebSocket {
    pub fn new(session_id: String, state: web::Data<AppState>) -> Self {
        let heartbeat_interval = state.config.session.heartbeat_interval();
        let client_timeout = state.config.session.client_timeout();
        Self {
            session_id,
            state,
            session: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn heard_from_client(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, err: &RegistryError) {
        warn!(session_id = %self.session_id, "Rejecting connection: {}", err);
        let event = TranscriptEvent::error(&SessionMeta::default(), err.to_string());
        if let Ok(frame) = encode_event(&event) {
            ctx.text(frame);
        }
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Again,
            description: Some(err.to_string()),
        }));
        ctx.stop();
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "Client heartbeat timed out");
                if let Some(session) = &act.session {
                    session.peer_disconnected();
                }
                ctx.stop();
                return;
            }

            ctx.ping(b"");
            if let Some(session) = &act.session {
                session.push_event(TranscriptEvent::ping());
            }
        });
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let sink: Arc<dyn EventSink> = Arc::new(WsSink::new(ctx.address()));
        match Session::open(
            self.session_id.clone(),
            &self.state.config,
            Arc::clone(&self.state.engine),
            Arc::clone(&self.state.registry),
            sink,
        ) {
            Ok(session) => {
                info!(session_id = %self.session_id, "WebSocket connection started");
                self.session = Some(session);
                self.start_heartbeat(ctx);
            }
            Err(e) => self.reject(ctx, &e),
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "WebSocket actor stopped");
        if let Some(session) = self.session.take() {
            session.peer_disconnected();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let Some(session) = self.session.clone() else {
            return;
        };

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.heard_from_client();
                session.handle_text(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                self.heard_from_client();
                session.ingest_audio(&data);
            }
            Ok(ws::Message::Ping(payload)) => {
                self.heard_from_client();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => self.heard_from_client(),
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "Client closed the connection");
                session.peer_disconnected();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Ignoring fragmented frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                session.transport_error();
                ctx.stop();
            }
        }
    }
}

impl Handler<DeliverEvent> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: DeliverEvent, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseConnection> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseConnection, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Closing connection");
        ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Normal)));
        ctx.stop();
    }
}

fn upgrade(
    session_id: String,
    req: &HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    if !state.engine.is_available() {
        return Err(AppError::Unavailable("Speech engine is not loaded".to_string()).into());
    }
    state.registry.check_admission(&session_id).map_err(|e| match e {
        RegistryError::Full { .. } => AppError::Unavailable(e.to_string()),
        RegistryError::Duplicate(_) => AppError::BadRequest(e.to_string()),
    })?;

    ws::start(AudioWebSocket::new(session_id, state), req, stream)
}

/// `GET /ws` and `GET /`: server-assigned session id.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    upgrade(uuid::Uuid::new_v4().to_string(), &req, stream, state)
}

/// `GET /ws/{session_id}`: client-chosen session id.
pub async fn audio_websocket_with_id(
    req: HttpRequest,
    path: web::Path<String>,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    if session_id.trim().is_empty() {
        return Err(AppError::BadRequest("Session id must not be empty".to_string()).into());
    }
    upgrade(session_id, &req, stream, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::{ScriptedLoader, Step};
    use crate::transcription::EnginePool;
    use actix_web::{http::StatusCode, test as actix_test, App};

    fn app_state(pool: EnginePool) -> web::Data<AppState> {
        web::Data::new(AppState::new(AppConfig::default(), Arc::new(pool)))
    }

    #[test]
    fn test_event_encodes_as_tagged_json() {
        let meta = SessionMeta {
            meeting_id: "m-1".to_string(),
            speaker: "alice".to_string(),
        };
        let frame = encode_event(&TranscriptEvent::transcription(
            &meta,
            "hello".to_string(),
            "en".to_string(),
        ))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "transcription");
        assert_eq!(value["meetingId"], "m-1");
        assert_eq!(value["text"], "hello");
    }

    #[actix_web::test]
    async fn test_upgrade_refused_while_engine_unloaded() {
        let loader = Arc::new(ScriptedLoader::new(vec![Step::text("unused")]));
        let state = app_state(EnginePool::new(loader, 1));
        let app = actix_test::init_service(
            App::new()
                .app_data(state)
                .route("/ws", web::get().to(audio_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_plain_get_without_upgrade_is_rejected() {
        let loader = Arc::new(ScriptedLoader::new(vec![Step::text("unused")]));
        let pool = EnginePool::new(loader, 1);
        pool.load().await.unwrap();
        let state = app_state(pool);
        let app = actix_test::init_service(
            App::new()
                .app_data(state)
                .route("/ws/{session_id}", web::get().to(audio_websocket_with_id)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws/abc").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
