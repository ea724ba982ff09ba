//! Session: one logical conversation over one transport
//!
//! A session owns request-id allocation and correlation, runs the receive
//! loop that dispatches inbound requests to a [`RequestHandler`], and queues
//! inbound notifications for a single consumer. Teardown resolves every
//! pending request with [`RelayError::SessionClosed`], runs the close hooks
//! once, and closes the transport.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::mcp::{
    methods, LoggingLevel, LoggingMessageParams, Message, Notification, Request, RequestId,
    Response,
};
use crate::transport::Transport;

/// Session identifier
pub type SessionId = String;

/// Default capacity of the inbound notification queue
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Lifecycle: open → active → closing → closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Created, receive loop not started
    Open,
    Active,
    /// Teardown in progress; new sends fail
    Closing,
    Closed,
}

/// Handles requests arriving on a session
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, request: Request) -> Result<Value>;
}

/// Handler for the client side: answers `ping`, rejects everything else
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientHandler;

#[async_trait]
impl RequestHandler for ClientHandler {
    async fn handle(&self, _ctx: RequestContext, request: Request) -> Result<Value> {
        match request.method.as_str() {
            methods::PING => Ok(json!({})),
            other => Err(RelayError::MethodNotFound(other.to_string())),
        }
    }
}

/// Per-request view handed to handlers
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    session: Session,
}

impl RequestContext {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Emit a log notification tied to the request being handled
    pub async fn send_log(
        &self,
        level: LoggingLevel,
        logger: impl Into<String>,
        data: Value,
    ) -> Result<()> {
        let params = LoggingMessageParams {
            level,
            logger: Some(logger.into()),
            data,
        };
        let notification = Notification::new(methods::LOG_MESSAGE, serde_json::to_value(params)?)
            .related_to(self.request_id.clone());
        self.session.send(notification).await
    }
}

type CloseHook = Box<dyn FnOnce(&str) + Send>;

struct SessionInner {
    id: SessionId,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn RequestHandler>,
    state: watch::Sender<SessionState>,
    next_id: AtomicI64,
    pending: DashMap<RequestId, oneshot::Sender<Result<Value>>>,
    notifications: Mutex<Option<mpsc::Sender<Notification>>>,
    /// `None` once the hooks have run
    close_hooks: Mutex<Option<Vec<CloseHook>>>,
    /// Serializes transport writes so wire order matches call order
    write_lock: tokio::sync::Mutex<()>,
}

/// Cheaply cloneable handle to a session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session with a fresh random id
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn RequestHandler>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), transport, handler)
    }

    pub fn with_id(
        id: impl Into<SessionId>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Open);
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                transport,
                handler,
                state,
                next_id: AtomicI64::new(1),
                pending: DashMap::new(),
                notifications: Mutex::new(None),
                close_hooks: Mutex::new(Some(Vec::new())),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Client-side session answering only `ping`
    pub fn client(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, Arc::new(ClientHandler))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn peer(&self) -> String {
        self.inner.transport.peer()
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Spawn the receive loop and mark the session active
    pub fn start(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }
        tracing::info!("Session {} started with {}", self.id(), self.peer());
        let session = self.clone();
        tokio::spawn(async move { session.receive_loop().await });
    }

    /// Take the inbound notification stream
    ///
    /// Replaces any earlier consumer. Notifications arriving while the queue
    /// is full are dropped with a warning.
    pub fn subscribe_notifications(&self, capacity: usize) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut slot = self.inner.notifications.lock();
        if self.state() < SessionState::Closing {
            *slot = Some(tx);
        }
        rx
    }

    /// Run `hook` once during teardown, or now if teardown already ran
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let mut hooks = self.inner.close_hooks.lock();
        match hooks.as_mut() {
            Some(pending) => pending.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook(self.id());
            }
        }
    }

    /// Handler context for `request_id`, for invoking capabilities directly
    pub fn context_for(&self, request_id: RequestId) -> RequestContext {
        RequestContext {
            request_id,
            session: self.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() >= SessionState::Closing {
            return Err(RelayError::SessionClosed);
        }
        Ok(())
    }

    /// Send a request; the returned handle resolves with its response
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> Result<PendingRequest> {
        self.ensure_open()?;
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let handle = PendingRequest {
            id: id.clone(),
            rx,
            session: Arc::downgrade(&self.inner),
        };

        // Teardown may have drained the pending map before the insert above
        self.ensure_open()?;

        self.write(Request::new(id, method, params).into()).await?;
        Ok(handle)
    }

    /// Send a request and wait for its result
    pub async fn request(&self, method: impl Into<String>, params: Value) -> Result<Value> {
        self.send_request(method, params).await?.wait().await
    }

    pub async fn send_notification(&self, method: impl Into<String>, params: Value) -> Result<()> {
        self.send(Notification::new(method, params)).await
    }

    pub async fn send(&self, notification: Notification) -> Result<()> {
        self.ensure_open()?;
        self.write(notification.into()).await
    }

    async fn write(&self, message: Message) -> Result<()> {
        let result = {
            let _guard = self.inner.write_lock.lock().await;
            self.inner.transport.write(message).await
        };
        if let Err(e) = &result {
            if e.is_fatal() && !matches!(e, RelayError::SessionClosed) {
                tracing::error!("Write on session {} failed: {}", self.id(), e);
                let _ = self.close().await;
            }
        }
        result
    }

    async fn receive_loop(self) {
        let mut state = self.inner.state.subscribe();
        loop {
            let closing = async {
                let _ = state.wait_for(|s| *s >= SessionState::Closing).await;
            };
            let next = tokio::select! {
                _ = closing => break,
                next = self.inner.transport.read() => next,
            };
            match next {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => {
                    tracing::info!("Peer {} ended session {}", self.peer(), self.id());
                    break;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Session {} transport failed: {}", self.id(), e);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Session {} dropped inbound message: {}", self.id(), e);
                }
            }
        }
        let _ = self.close().await;
    }

    fn dispatch(&self, message: Message) {
        tracing::debug!(
            "Session {} received {} {}",
            self.id(),
            message.kind(),
            message.method().unwrap_or("")
        );
        match message {
            Message::Response(response) => self.resolve(response),
            Message::Request(request) => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_request(request).await });
            }
            Message::Notification(notification) => self.enqueue(notification),
        }
    }

    fn resolve(&self, response: Response) {
        match self.inner.pending.remove(&response.id) {
            Some((_, slot)) => {
                let _ = slot.send(response.outcome.map_err(RelayError::from));
            }
            None => {
                let err = RelayError::Protocol(format!("unexpected response id {}", response.id));
                tracing::warn!("Session {}: {}", self.id(), err);
            }
        }
    }

    async fn handle_request(&self, request: Request) {
        let id = request.id.clone();
        let ctx = self.context_for(id.clone());
        let response = match self.inner.handler.handle(ctx, request).await {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                tracing::debug!("Request {} on session {} failed: {}", id, self.id(), e);
                Response::from_error(id, &e)
            }
        };
        if self.state() >= SessionState::Closing {
            return;
        }
        if let Err(e) = self.write(response.into()).await {
            tracing::debug!("Could not answer on session {}: {}", self.id(), e);
        }
    }

    fn enqueue(&self, notification: Notification) {
        let mut slot = self.inner.notifications.lock();
        let Some(tx) = slot.as_ref() else {
            tracing::debug!(
                "No notification consumer on session {}, dropping {}",
                self.id(),
                notification.method
            );
            return;
        };
        match tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(
                    "Notification queue full on session {}, dropping {}",
                    self.id(),
                    n.method
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *slot = None;
            }
        }
    }

    /// Tear the session down
    ///
    /// Idempotent. Pending requests resolve with `SessionClosed`, the
    /// notification queue ends, close hooks run, then the transport closes.
    pub async fn close(&self) -> Result<()> {
        let began = self.inner.state.send_if_modified(|state| {
            if *state < SessionState::Closing {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if !began {
            return Ok(());
        }
        tracing::info!("Closing session {}", self.id());

        let ids: Vec<RequestId> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = self.inner.pending.remove(&id) {
                let _ = slot.send(Err(RelayError::SessionClosed));
            }
        }
        self.inner.notifications.lock().take();

        let hooks = self.inner.close_hooks.lock().take().unwrap_or_default();
        for hook in hooks {
            hook(self.id());
        }

        let result = self.inner.transport.close().await;
        if let Err(e) = &result {
            tracing::debug!("Transport close for session {} failed: {}", self.id(), e);
        }
        self.inner.state.send_replace(SessionState::Closed);
        tracing::info!("Session {} closed", self.id());
        result
    }

    /// Resolves once teardown has finished
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Handle for one in-flight request
///
/// Dropping an unresolved handle forgets the request; a late response is
/// then reported as unexpected.
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
    session: Weak<SessionInner>,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub async fn wait(mut self) -> Result<Value> {
        (&mut self.rx).await.map_err(|_| RelayError::SessionClosed)?
    }

    /// Wait at most `timeout`; expiry fails with [`RelayError::Timeout`]
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(outcome) => outcome.map_err(|_| RelayError::SessionClosed)?,
            Err(_) => Err(RelayError::Timeout),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            inner.pending.remove(&self.id);
        }
    }
}
