//! Progress fan-out
//!
//! Per-operation publish/subscribe. Publishing never waits on
//! subscribers: a slow or absent observer can lag and drop events but can
//! always re-sync from the operation's status snapshot. The stream closes
//! when the operation reaches a terminal status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

/// Per-operation buffer; laggards skip ahead instead of stalling the
/// publisher.
const CHANNEL_CAPACITY: usize = 256;

/// Event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressEventKind {
    Progress,
    ItemCompleted,
    Completed,
    Failed,
}

/// One progress event. Immutable after publish.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ProgressEventKind,
    /// 0-100, monotone non-decreasing within one operation
    pub percent: u8,
    pub message: String,
    pub item_ref_id: Option<String>,
}

impl ProgressEvent {
    pub fn new(
        operation_id: &str,
        kind: ProgressEventKind,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            timestamp: Utc::now(),
            kind,
            percent: percent.min(100),
            message: message.into(),
            item_ref_id: None,
        }
    }

    pub fn with_item(mut self, ref_id: &str) -> Self {
        self.item_ref_id = Some(ref_id.to_string());
        self
    }
}

/// Fan-out of progress events, one broadcast channel per operation.
#[derive(Default)]
pub struct ProgressChannel {
    senders: tokio::sync::RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the channel for an operation. Idempotent.
    pub async fn register(&self, operation_id: &str) {
        self.senders
            .write()
            .await
            .entry(operation_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
    }

    /// Publish one event. Never blocks; events published before
    /// registration or after close are dropped.
    pub async fn publish(&self, event: ProgressEvent) {
        let senders = self.senders.read().await;
        if let Some(sender) = senders.get(&event.operation_id) {
            // send only fails when no receiver is subscribed, which is fine
            let _ = sender.send(event);
        } else {
            debug!(
                "Dropping progress event for unregistered operation {}",
                event.operation_id
            );
        }
    }

    /// Subscribe to an operation's events from this point forward.
    /// Returns None once the operation is terminal (channel closed).
    pub async fn subscribe(
        &self,
        operation_id: &str,
    ) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.senders
            .read()
            .await
            .get(operation_id)
            .map(|s| s.subscribe())
    }

    /// Close an operation's channel; subscriber streams end after
    /// draining what was already published.
    pub async fn close(&self, operation_id: &str) {
        self.senders.write().await.remove(operation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let channel = ProgressChannel::new();
        channel.register("op-1").await;
        let mut rx = channel.subscribe("op-1").await.unwrap();

        for percent in [0u8, 50, 100] {
            channel
                .publish(ProgressEvent::new(
                    "op-1",
                    ProgressEventKind::Progress,
                    percent,
                    "working",
                ))
                .await;
        }

        assert_eq!(rx.recv().await.unwrap().percent, 0);
        assert_eq!(rx.recv().await.unwrap().percent, 50);
        assert_eq!(rx.recv().await.unwrap().percent, 100);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let channel = ProgressChannel::new();
        channel.register("op-1").await;

        // Overfill the buffer; the publisher must never stall.
        for i in 0..(CHANNEL_CAPACITY * 2) {
            channel
                .publish(ProgressEvent::new(
                    "op-1",
                    ProgressEventKind::Progress,
                    (i % 100) as u8,
                    "noisy",
                ))
                .await;
        }
    }

    #[tokio::test]
    async fn test_stream_ends_after_close() {
        let channel = ProgressChannel::new();
        channel.register("op-1").await;
        let mut rx = channel.subscribe("op-1").await.unwrap();

        channel
            .publish(ProgressEvent::new(
                "op-1",
                ProgressEventKind::Completed,
                100,
                "done",
            ))
            .await;
        channel.close("op-1").await;

        // The buffered terminal event still arrives, then the stream ends.
        assert_eq!(rx.recv().await.unwrap().kind, ProgressEventKind::Completed);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        assert!(channel.subscribe("op-1").await.is_none());
    }

    #[tokio::test]
    async fn test_events_are_scoped_per_operation() {
        let channel = ProgressChannel::new();
        channel.register("op-1").await;
        channel.register("op-2").await;
        let mut rx = channel.subscribe("op-2").await.unwrap();

        channel
            .publish(ProgressEvent::new("op-1", ProgressEventKind::Progress, 10, "a"))
            .await;
        channel
            .publish(ProgressEvent::new("op-2", ProgressEventKind::Progress, 20, "b"))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation_id, "op-2");
        assert_eq!(event.percent, 20);
    }
}
