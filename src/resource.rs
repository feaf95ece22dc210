//! Resource manager (C6): subscriptions, cancellation set, progress
//! accounting, and per-request timeouts, all keyed by stringified request
//! IDs so numeric and string IDs interoperate.

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::RequestKey;
use dashmap::{DashMap, DashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub resource_uri: String,
    pub client_id: String,
    pub created_at: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressRecord {
    pub progress: u64,
    pub total: u64,
}

/// Emitted to the front-end when a request is cancelled, so it can push
/// `notifications/cancelled` to the host.
#[derive(Debug, Clone)]
pub struct CancellationEvent {
    pub request_key: RequestKey,
}

pub struct ResourceManager {
    subscriptions: DashMap<String, Subscription>,
    cancelled: DashSet<RequestKey>,
    progress: DashMap<RequestKey, ProgressRecord>,
    timeouts: DashMap<RequestKey, JoinHandle<()>>,
    cancel_tx: mpsc::UnboundedSender<CancellationEvent>,
    cancel_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CancellationEvent>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions: DashMap::new(),
            cancelled: DashSet::new(),
            progress: DashMap::new(),
            timeouts: DashMap::new(),
            cancel_tx,
            cancel_rx: tokio::sync::Mutex::new(cancel_rx),
        }
    }

    pub fn subscribe(&self, subscription_id: &str, resource_uri: &str, client_id: &str) -> ProxyResult<()> {
        if self.subscriptions.contains_key(subscription_id) {
            return Err(ProxyError::invalid_params(format!(
                "duplicate subscription id '{subscription_id}'"
            )));
        }
        self.subscriptions.insert(
            subscription_id.to_string(),
            Subscription {
                subscription_id: subscription_id.to_string(),
                resource_uri: resource_uri.to_string(),
                client_id: client_id.to_string(),
                created_at: now_unix(),
                active: true,
            },
        );
        Ok(())
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        if let Some(mut sub) = self.subscriptions.get_mut(subscription_id) {
            sub.active = false;
        }
    }

    pub fn subscriptions_by_resource(&self, uri: &str) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.active && entry.resource_uri == uri)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Marks a request cancelled and emits a `CancellationEvent` the
    /// front-end can turn into `notifications/cancelled`. Idempotent.
    pub fn cancel_request(&self, key: RequestKey) {
        if self.cancelled.insert(key.clone()) {
            if let Some((_, handle)) = self.timeouts.remove(&key) {
                handle.abort();
            }
            let _ = self.cancel_tx.send(CancellationEvent { request_key: key });
        }
    }

    /// Whether a response for `key` should be dropped because the request
    /// was already cancelled.
    pub fn is_cancelled(&self, key: &RequestKey) -> bool {
        self.cancelled.contains(key)
    }

    pub fn update_progress(&self, key: RequestKey, progress: u64, total: u64) -> ProxyResult<()> {
        if progress > total {
            return Err(ProxyError::invalid_params(format!(
                "progress {progress} exceeds total {total}"
            )));
        }
        self.progress.insert(key, ProgressRecord { progress, total });
        Ok(())
    }

    pub fn progress_of(&self, key: &RequestKey) -> Option<ProgressRecord> {
        self.progress.get(key).map(|r| *r)
    }

    /// Installs a timer that cancels `key` after `duration` unless cleared.
    pub fn set_timeout(self: &std::sync::Arc<Self>, key: RequestKey, duration: Duration) {
        let manager = self.clone();
        let timeout_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager.cancel_request(timeout_key);
        });
        self.timeouts.insert(key, handle);
    }

    pub fn clear_timeout(&self, key: &RequestKey) {
        if let Some((_, handle)) = self.timeouts.remove(key) {
            handle.abort();
        }
    }

    /// Awaits the next cancellation event, for the front-end's relay loop.
    pub async fn next_cancellation(&self) -> Option<CancellationEvent> {
        self.cancel_rx.lock().await.recv().await
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageId;

    #[test]
    fn subscribe_then_unsubscribe_empties_lookup() {
        let mgr = ResourceManager::new();
        mgr.subscribe("sub1", "file:///a", "client1").unwrap();
        assert_eq!(mgr.subscriptions_by_resource("file:///a").len(), 1);
        mgr.unsubscribe("sub1");
        assert!(mgr.subscriptions_by_resource("file:///a").is_empty());
    }

    #[test]
    fn duplicate_subscription_id_is_rejected() {
        let mgr = ResourceManager::new();
        mgr.subscribe("sub1", "file:///a", "client1").unwrap();
        assert!(mgr.subscribe("sub1", "file:///b", "client2").is_err());
    }

    #[test]
    fn progress_rejects_progress_exceeding_total() {
        let mgr = ResourceManager::new();
        let key = RequestKey::from(MessageId::Number(1));
        assert!(mgr.update_progress(key.clone(), 5, 10).is_ok());
        assert!(mgr.update_progress(key, 11, 10).is_err());
    }

    #[tokio::test]
    async fn cancelling_a_request_marks_it_dropped() {
        let mgr = ResourceManager::new();
        let key = RequestKey::from(MessageId::Number(7));
        assert!(!mgr.is_cancelled(&key));
        mgr.cancel_request(key.clone());
        assert!(mgr.is_cancelled(&key));
        let event = mgr.next_cancellation().await.unwrap();
        assert_eq!(event.request_key, key);
    }

    #[tokio::test]
    async fn timeout_cancels_after_duration() {
        let mgr = std::sync::Arc::new(ResourceManager::new());
        let key = RequestKey::from(MessageId::Number(9));
        mgr.set_timeout(key.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(mgr.is_cancelled(&key));
    }
}
