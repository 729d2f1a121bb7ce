//! Periodic registry snapshots pushed to observers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::message::ServerMessage;
use crate::registry::SessionRegistry;

/// Background broadcaster of `STATUS` envelopes.
pub struct StatusBroadcaster {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl StatusBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "status broadcaster started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.broadcast_once().await;
                }
                _ = shutdown.changed() => {
                    info!("status broadcaster shutting down");
                    break;
                }
            }
        }
    }

    /// Send one snapshot to every observer and prune closed ones.
    /// Returns the number of observers reached.
    pub async fn broadcast_once(&self) -> usize {
        let observers: Vec<_> = self.registry.read().await.observers.values().cloned().collect();
        if observers.is_empty() {
            return 0;
        }

        let snapshot = self.registry.snapshot().await;
        let message = match serde_json::to_string(&snapshot) {
            Ok(json) => ServerMessage::status(json),
            Err(e) => {
                warn!(error = %e, "failed to encode registry snapshot");
                return 0;
            }
        };

        let mut closed = Vec::new();
        let mut reached = 0;
        for observer in &observers {
            match observer.send(&message) {
                Ok(()) => reached += 1,
                Err(_) => closed.push(observer.session_id()),
            }
        }

        if !closed.is_empty() {
            let mut state = self.registry.write().await;
            for session_id in &closed {
                state.observers.remove(session_id);
            }
            debug!(pruned = closed.len(), "closed observers pruned");
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::message::ReplyCode;
    use crate::registry::RegistrySnapshot;

    #[tokio::test]
    async fn no_observers_means_no_work() {
        let broadcaster = StatusBroadcaster::new(Arc::new(SessionRegistry::new()), Duration::from_secs(5));
        assert_eq!(broadcaster.broadcast_once().await, 0);
    }

    #[tokio::test]
    async fn snapshots_reach_live_observers_and_prune_closed_ones() {
        let registry = Arc::new(SessionRegistry::new());
        let (live, mut live_rx) = ChannelHandle::pair(1);
        let (dead, dead_rx) = ChannelHandle::pair(2);
        drop(dead_rx);
        {
            let mut state = registry.write().await;
            state.observers.insert(1, live);
            state.observers.insert(2, dead);
        }

        let broadcaster = StatusBroadcaster::new(Arc::clone(&registry), Duration::from_secs(5));
        assert_eq!(broadcaster.broadcast_once().await, 1);
        assert_eq!(registry.observer_count().await, 1);

        let message = ServerMessage::parse(&live_rx.recv().await.unwrap()).unwrap();
        assert_eq!(message.message_code, ReplyCode::Status);
        let snapshot: RegistrySnapshot = serde_json::from_str(&message.body).unwrap();
        assert!(snapshot.controls.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let broadcaster = StatusBroadcaster::new(Arc::new(SessionRegistry::new()), Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { broadcaster.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
