//! Session manager: creates server sessions as transports connect

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::McpServer;
use crate::session::{Session, SessionId};
use crate::transport::{ChannelListener, Transport};

/// Tracks live server sessions
///
/// Cloning shares the same session table.
#[derive(Clone)]
pub struct SessionManager {
    server: Arc<McpServer>,
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl SessionManager {
    pub fn new(server: Arc<McpServer>) -> Self {
        Self {
            server,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn server(&self) -> &Arc<McpServer> {
        &self.server
    }

    /// Start a server session over `transport`
    pub fn open(&self, transport: Arc<dyn Transport>) -> Session {
        self.open_with_id(Uuid::new_v4().to_string(), transport)
    }

    pub fn open_with_id(&self, id: impl Into<SessionId>, transport: Arc<dyn Transport>) -> Session {
        let session = Session::with_id(id, transport, self.server.clone());
        let subscriptions = self.server.subscriptions().clone();
        subscriptions.register_session(session.id(), Arc::new(session.clone()));

        let sessions = self.sessions.clone();
        let released = subscriptions.clone();
        session.on_close(move |id| {
            let removed = released.release_session(id);
            sessions.remove(id);
            tracing::debug!("Released {} subscription(s) of session {}", removed, id);
        });

        self.sessions
            .insert(session.id().to_string(), session.clone());
        session.start();
        session
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Close one session; false if it is unknown
    pub async fn terminate(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if let Err(e) = session.close().await {
            tracing::debug!("Closing session {}: {}", id, e);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every live session
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        tracing::info!("Shutting down {} session(s)", sessions.len());
        for session in sessions {
            let _ = session.close().await;
        }
    }

    /// Open a session for every new peer on `listener`
    ///
    /// Runs until the fabric inbox closes.
    pub async fn serve_channel(&self, mut listener: ChannelListener) {
        while let Some(transport) = listener.accept().await {
            let session = self.open(Arc::new(transport));
            tracing::info!("Channel session {} for {}", session.id(), session.peer());
        }
        tracing::info!("Channel listener {} stopped", listener.local());
    }
}
