//! Relay-side fan-out: one broadcast group per channel name.
//!
//! Uses tokio broadcast channels for O(1) publish to all subscribers.
//! Each connection gets an independent receiver buffering up to
//! `capacity` frames; lagging connections drop the oldest frames rather
//! than stalling the publisher.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, ProtocolError};

/// Snapshot of a group's publish counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_published: u64,
    pub active_subscribers: usize,
}

/// Fan-out group for one channel name.
///
/// Subscriber bookkeeping is by connection id; the actual delivery path
/// (`publish_raw`) is lock-free — broadcast send plus an atomic counter.
pub struct ChannelGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: Arc<RwLock<HashSet<Uuid>>>,
    capacity: usize,
    frames_published: AtomicU64,
}

impl ChannelGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            frames_published: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand it a receiver.
    pub async fn subscribe(&self, conn_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.subscribers.write().await.insert(conn_id);
        self.sender.subscribe()
    }

    /// Drop a connection's registration. The receiver side is closed by
    /// the connection task itself.
    pub async fn unsubscribe(&self, conn_id: Uuid) -> bool {
        self.subscribers.write().await.remove(&conn_id)
    }

    /// Publish a frame to every subscriber. Returns the receiver count.
    pub fn publish(&self, frame: &Frame) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.publish_raw(Arc::new(encoded)))
    }

    /// Publish pre-encoded bytes (zero-copy fast path, lock-free).
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, conn_id: Uuid) -> bool {
        self.subscribers.read().await.contains(&conn_id)
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel names to their fan-out groups.
///
/// Each page/component channel gets its own group so frames never leak
/// between documents.
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, Arc<ChannelGroup>>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for a channel name.
    pub async fn get_or_create(&self, channel: &str) -> Arc<ChannelGroup> {
        // Fast path: read lock.
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(channel) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring the write lock.
        if let Some(group) = channels.get(channel) {
            return group.clone();
        }
        let group = Arc::new(ChannelGroup::new(self.default_capacity));
        channels.insert(channel.to_string(), group.clone());
        group
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<ChannelGroup>> {
        self.channels.read().await.get(channel).cloned()
    }

    /// Remove a channel with no remaining subscribers.
    pub async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(channel) {
            if group.subscriber_count().await == 0 {
                channels.remove(channel);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{page_channel, ChannelEvent, COMPONENTS_CHANNEL};
    use lattice_core::LayerPatch;

    fn update_frame(channel: &str) -> Frame {
        Frame::Event {
            channel: channel.to_string(),
            event: ChannelEvent::LayerUpdate {
                page_id: Uuid::new_v4(),
                layer_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                changes: LayerPatch::default(),
                timestamp: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let group = ChannelGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.subscribe(conn).await;
        assert_eq!(group.subscriber_count().await, 1);
        assert!(group.has_subscriber(conn).await);

        assert!(group.unsubscribe(conn).await);
        assert_eq!(group.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = ChannelGroup::new(16);
        let mut rx1 = group.subscribe(Uuid::new_v4()).await;
        let mut rx2 = group.subscribe(Uuid::new_v4()).await;
        let mut rx3 = group.subscribe(Uuid::new_v4()).await;

        let count = group.publish(&update_frame("page:x:updates")).unwrap();
        assert_eq!(count, 3);

        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
        rx3.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_raw_zero_copy() {
        let group = ChannelGroup::new(16);
        let mut rx = group.subscribe(Uuid::new_v4()).await;

        let bytes = Arc::new(update_frame(COMPONENTS_CHANNEL).encode().unwrap());
        assert_eq!(group.publish_raw(bytes.clone()), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(*received, *bytes);
    }

    #[tokio::test]
    async fn test_stats_count_publishes() {
        let group = ChannelGroup::new(16);
        let _rx = group.subscribe(Uuid::new_v4()).await;
        group.publish(&Frame::Ping).unwrap();
        group.publish(&Frame::Ping).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.frames_published, 2);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_registry_reuses_groups() {
        let registry = ChannelRegistry::new(16);
        let channel = page_channel(Uuid::new_v4());

        let a = registry.get_or_create(&channel).await;
        let b = registry.get_or_create(&channel).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_channels() {
        let registry = ChannelRegistry::new(16);
        let page_a = page_channel(Uuid::new_v4());
        let page_b = page_channel(Uuid::new_v4());

        let group_a = registry.get_or_create(&page_a).await;
        let group_b = registry.get_or_create(&page_b).await;

        let mut rx_a = group_a.subscribe(Uuid::new_v4()).await;
        let _rx_b = group_b.subscribe(Uuid::new_v4()).await;

        group_b.publish(&update_frame(&page_b)).unwrap();

        // Channel A's receiver must stay silent.
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx_a.recv()).await;
        assert!(result.is_err(), "frame leaked across channels");
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let registry = ChannelRegistry::new(16);
        let channel = page_channel(Uuid::new_v4());
        let group = registry.get_or_create(&channel).await;

        let conn = Uuid::new_v4();
        let _rx = group.subscribe(conn).await;
        assert!(!registry.remove_if_empty(&channel).await);

        group.unsubscribe(conn).await;
        assert!(registry.remove_if_empty(&channel).await);
        assert_eq!(registry.channel_count().await, 0);
    }
}
