//! Resource subscriptions per session

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;

use crate::error::Result;
use crate::mcp::Notification;
use crate::session::{Session, SessionId};

/// Destination for change notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

#[async_trait]
impl NotificationSink for Session {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.send(notification).await
    }
}

struct SessionEntry {
    sink: Arc<dyn NotificationSink>,
    resources: HashSet<String>,
}

/// Which sessions watch which resources
///
/// Only registered sessions can subscribe. Lock order is session entry
/// before resource entry; `notify_change` never holds both.
#[derive(Default)]
pub struct SubscriptionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    by_resource: DashMap<String, HashSet<SessionId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the sink used to reach `session_id`
    pub fn register_session(&self, session_id: &str, sink: Arc<dyn NotificationSink>) {
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                sink,
                resources: HashSet::new(),
            },
        );
    }

    /// Idempotent; returns false if the session is not registered
    pub fn subscribe(&self, session_id: &str, resource: &str) -> bool {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            tracing::debug!("Ignoring subscribe from unknown session {}", session_id);
            return false;
        };
        if entry.resources.insert(resource.to_string()) {
            self.by_resource
                .entry(resource.to_string())
                .or_default()
                .insert(session_id.to_string());
        }
        true
    }

    /// Idempotent; unsubscribing without a subscription is a no-op
    pub fn unsubscribe(&self, session_id: &str, resource: &str) {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        if entry.resources.remove(resource) {
            self.remove_subscriber(resource, session_id);
        }
    }

    fn remove_subscriber(&self, resource: &str, session_id: &str) {
        if let Some(mut subscribers) = self.by_resource.get_mut(resource) {
            subscribers.remove(session_id);
        }
        self.by_resource
            .remove_if(resource, |_, subscribers| subscribers.is_empty());
    }

    pub fn is_subscribed(&self, session_id: &str, resource: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| e.resources.contains(resource))
            .unwrap_or(false)
    }

    pub fn subscribers(&self, resource: &str) -> Vec<SessionId> {
        self.by_resource
            .get(resource)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of resources `session_id` is subscribed to
    pub fn subscription_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|e| e.resources.len())
            .unwrap_or(0)
    }

    /// Deliver `notification` to every subscriber of `resource`
    ///
    /// Best effort: a failing subscriber is logged and skipped. Returns the
    /// number of successful deliveries.
    pub async fn notify_change(&self, resource: &str, notification: Notification) -> usize {
        let sinks: Vec<(SessionId, Arc<dyn NotificationSink>)> = self
            .subscribers(resource)
            .into_iter()
            .filter_map(|id| {
                let sink = self.sessions.get(&id).map(|e| e.sink.clone())?;
                Some((id, sink))
            })
            .collect();

        let deliveries = sinks.into_iter().map(|(id, sink)| {
            let notification = notification.clone();
            async move {
                match sink.notify(notification).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Change notification to session {} failed: {}", id, e);
                        false
                    }
                }
            }
        });
        let delivered = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();
        tracing::debug!("Notified {} subscriber(s) of {}", delivered, resource);
        delivered
    }

    /// Drop the session and all of its subscriptions
    ///
    /// Returns how many subscriptions were removed.
    pub fn release_session(&self, session_id: &str) -> usize {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return 0;
        };
        for resource in &entry.resources {
            self.remove_subscriber(resource, session_id);
        }
        entry.resources.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
