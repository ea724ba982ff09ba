//! Streamable HTTP binding
//!
//! One mount path, `/mcp`:
//! - `POST` carries one client message. Requests are answered with an SSE
//!   stream (or one JSON body in JSON-only mode); notifications and
//!   responses get `202 Accepted`. An `initialize` without a session header
//!   opens a new session.
//! - `GET` opens the standalone SSE stream for server-initiated messages.
//! - `DELETE` ends the session.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use super::SessionManager;
use crate::config::{JsonNotificationPolicy, ServerConfig};
use crate::error::{RelayError, Result};
use crate::mcp::{codec, methods, ErrorObject, Message};
use crate::session::SessionId;
use crate::transport::stream::OutboundStream;
use crate::transport::{StreamTransport, SESSION_HEADER};

/// Mount path of the MCP endpoint
pub const MCP_PATH: &str = "/mcp";

#[derive(Clone)]
pub struct HttpState {
    manager: SessionManager,
    transports: Arc<DashMap<SessionId, Arc<StreamTransport>>>,
    config: Arc<ServerConfig>,
}

impl HttpState {
    pub fn new(config: ServerConfig, manager: SessionManager) -> Self {
        Self {
            manager,
            transports: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Number of sessions opened over HTTP and still live
    pub fn session_count(&self) -> usize {
        self.transports.len()
    }

    fn open_session(&self) -> (SessionId, Arc<StreamTransport>) {
        let id = Uuid::new_v4().to_string();
        let transport = Arc::new(StreamTransport::new());
        self.transports.insert(id.clone(), transport.clone());

        let session = self.manager.open_with_id(id.clone(), transport.clone());
        let transports = self.transports.clone();
        session.on_close(move |id| {
            transports.remove(id);
        });
        tracing::info!("HTTP session {} opened", id);
        (id, transport)
    }

    /// Close sessions idle for at least `timeout`; returns how many closed
    pub async fn reap_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<SessionId> = self
            .transports
            .iter()
            .filter(|entry| entry.value().idle_for().is_some_and(|idle| idle >= timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for id in idle {
            if self.manager.terminate(&id).await {
                tracing::info!("HTTP session {} closed after {:?} idle", id, timeout);
                closed += 1;
            }
        }
        closed
    }

    fn lookup(&self, headers: &HeaderMap) -> std::result::Result<(SessionId, Arc<StreamTransport>), Response> {
        let id = session_header(headers).ok_or_else(|| {
            (StatusCode::BAD_REQUEST, "Missing mcp-session-id header").into_response()
        })?;
        let transport = self
            .transports
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| (StatusCode::NOT_FOUND, "Unknown session").into_response())?;
        Ok((id, transport))
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn with_session(mut response: Response, id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

fn error_body(status: StatusCode, err: &RelayError) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": Value::Null,
        "error": ErrorObject::from(err),
    });
    (status, Json(body)).into_response()
}

/// Build the router with CORS and request tracing
pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        .route(
            MCP_PATH,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Rejecting malformed POST body: {}", e);
            return error_body(StatusCode::BAD_REQUEST, &e);
        }
    };

    let is_initialize = matches!(&message, Message::Request(r) if r.method == methods::INITIALIZE);
    let (session_id, transport) = if is_initialize && session_header(&headers).is_none() {
        state.open_session()
    } else {
        match state.lookup(&headers) {
            Ok(found) => found,
            Err(response) => return response,
        }
    };

    let request_id = match &message {
        Message::Request(r) => r.id.clone(),
        _ => {
            return match transport.deliver(message) {
                Ok(()) => with_session(StatusCode::ACCEPTED.into_response(), &session_id),
                Err(_) => (StatusCode::NOT_FOUND, "Session closed").into_response(),
            };
        }
    };

    let stream = match transport.open_request_stream(request_id) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Rejecting POST for session {}: {}", session_id, e);
            return with_session(error_body(StatusCode::CONFLICT, &e), &session_id);
        }
    };
    if transport.deliver(message).is_err() {
        return (StatusCode::NOT_FOUND, "Session closed").into_response();
    }

    let response = if state.config.json_response {
        json_reply(stream, state.config.json_notifications).await
    } else {
        sse_reply(stream).into_response()
    };
    with_session(response, &session_id)
}

/// Collect the request's stream into one JSON body
async fn json_reply(mut stream: OutboundStream, policy: JsonNotificationPolicy) -> Response {
    let mut notifications = Vec::new();
    let mut response = None;
    while let Some(message) = stream.recv().await {
        match message {
            Message::Response(_) => {
                response = Some(message);
                break;
            }
            other => notifications.push(other),
        }
    }

    let Some(response) = response else {
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, &RelayError::SessionClosed);
    };

    let body = match policy {
        JsonNotificationPolicy::Suppress => {
            if !notifications.is_empty() {
                tracing::debug!(
                    "Suppressed {} notification(s) in JSON response",
                    notifications.len()
                );
            }
            codec::to_value(&response)
        }
        JsonNotificationPolicy::Flush => {
            notifications.push(response);
            Value::Array(notifications.iter().map(codec::to_value).collect())
        }
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn sse_event(message: Message) -> std::result::Result<Event, Infallible> {
    Ok(Event::default()
        .event("message")
        .data(codec::to_value(&message).to_string()))
}

fn sse_reply(stream: OutboundStream) -> impl IntoResponse {
    Sse::new(UnboundedReceiverStream::new(stream).map(sse_event))
}

async fn handle_get(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let accepts_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream") || v.contains("*/*"))
        .unwrap_or(true);
    if !accepts_sse {
        return (StatusCode::NOT_ACCEPTABLE, "Client must accept text/event-stream").into_response();
    }

    let (session_id, transport) = match state.lookup(&headers) {
        Ok(found) => found,
        Err(response) => return response,
    };
    tracing::debug!("Standalone stream opened for session {}", session_id);
    let stream = transport.open_standalone_stream();
    let sse = Sse::new(UnboundedReceiverStream::new(stream).map(sse_event))
        .keep_alive(KeepAlive::default());
    with_session(sse.into_response(), &session_id)
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing mcp-session-id header").into_response();
    };
    if state.manager.terminate(&session_id).await {
        tracing::info!("HTTP session {} terminated by client", session_id);
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_with_shutdown<F>(listener: TcpListener, state: HttpState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = state.manager.clone();
    let reaper = state
        .config
        .session_idle_timeout
        .map(|timeout| tokio::spawn(reap_idle_sessions(state.clone(), timeout)));
    let app = router(state);
    tracing::info!("MCP endpoint listening on {}{}", listener.local_addr()?, MCP_PATH);
    // Open SSE bodies hold their connections, so sessions close before the drain
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            manager.shutdown().await;
        })
        .await?;
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    Ok(())
}

async fn reap_idle_sessions(state: HttpState, timeout: Duration) {
    let mut ticks = tokio::time::interval((timeout / 2).max(Duration::from_millis(10)));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        state.reap_idle(timeout).await;
    }
}

/// Bind `config.host:config.port` and serve until Ctrl-C
pub async fn serve(config: ServerConfig, manager: SessionManager) -> Result<()> {
    config.validate()?;
    let listener = TcpListener::bind(config.bind_address()).await?;
    let state = HttpState::new(config, manager);
    serve_with_shutdown(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    })
    .await
}
