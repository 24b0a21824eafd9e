//! WebSocket relay with per-channel fan-out and snapshot persistence.
//!
//! Architecture:
//! ```text
//! Editor A ──┐
//!            ├── channel "page:{id}:updates" ── authoritative tree
//! Editor B ──┘           │                          │
//!                  ChannelGroup (fan-out)     SnapshotStore (RocksDB)
//!                        │
//!              ┌─────────┴─────────┐
//!              ▼                   ▼
//!          Editor A            Editor B
//! ```
//!
//! Each page channel keeps an authoritative layer tree: published layer
//! events are applied server-side so a late subscriber receives the
//! current tree in its `State` frame instead of replaying history. The
//! tree is persisted when the channel empties and loaded back on the
//! next subscribe.
//!
//! The relay never filters echoes — every subscriber, including the
//! publisher, receives every frame. Echo suppression is the client
//! reconciler's job.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use lattice_core::{tree, Layer};
use uuid::Uuid;

use crate::broadcast::ChannelRegistry;
use crate::protocol::{parse_page_channel, ChannelEvent, Frame};
use crate::storage::{SnapshotStore, StoreConfig};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fan-out buffer capacity per channel
    pub channel_capacity: usize,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            channel_capacity: 256,
            storage_path: None,
        }
    }
}

/// Relay-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
    pub persisted_snapshots: u64,
}

/// Authoritative layer trees, one per open page channel.
type ChannelTrees = Arc<RwLock<HashMap<String, Vec<Layer>>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ChannelRegistry>,
    trees: ChannelTrees,
    stats: Arc<RwLock<RelayStats>>,
    store: Option<Arc<SnapshotStore>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self, crate::storage::StoreError> {
        let registry = Arc::new(ChannelRegistry::new(config.channel_capacity));
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(SnapshotStore::open(store_config)?))
            }
            None => None,
        };
        Ok(Self {
            config,
            registry,
            trees: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            store,
        })
    }

    /// In-memory relay with default config (no snapshot store).
    pub fn with_defaults() -> Self {
        let config = RelayConfig::default();
        Self {
            registry: Arc::new(ChannelRegistry::new(config.channel_capacity)),
            config,
            trees: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            store: None,
        }
    }

    /// Accept WebSocket connections until the task is cancelled.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let trees = self.trees.clone();
            let stats = self.stats.clone();
            let store = self.store.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, trees, stats, store).await
                {
                    log::warn!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<ChannelRegistry>,
        trees: ChannelTrees,
        stats: Arc<RwLock<RelayStats>>,
        store: Option<Arc<SnapshotStore>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Frames fanned in from all subscribed channels.
        let (fan_tx, mut fan_rx) = mpsc::channel::<Arc<Vec<u8>>>(256);
        // Forwarder task per subscription, keyed by channel name.
        let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame {
                                Frame::Subscribe { channel } => {
                                    if forwarders.contains_key(&channel) {
                                        log::debug!("{conn_id} re-subscribed {channel}");
                                    } else {
                                        let group = registry.get_or_create(&channel).await;
                                        let mut rx = group.subscribe(conn_id).await;
                                        let tx = fan_tx.clone();
                                        let handle = tokio::spawn(async move {
                                            loop {
                                                match rx.recv().await {
                                                    Ok(frame) => {
                                                        if tx.send(frame).await.is_err() {
                                                            break;
                                                        }
                                                    }
                                                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                                        log::warn!("subscriber lagged by {n} frames");
                                                    }
                                                    Err(_) => break,
                                                }
                                            }
                                        });
                                        forwarders.insert(channel.clone(), handle);
                                    }

                                    // State frame doubles as the subscribe ack.
                                    let layers =
                                        Self::channel_state(&channel, &trees, &store).await;
                                    let state = Frame::State {
                                        channel: channel.clone(),
                                        layers,
                                    };
                                    ws_sender
                                        .send(Message::Binary(state.encode()?.into()))
                                        .await?;

                                    let mut s = stats.write().await;
                                    s.active_channels = registry.channel_count().await;
                                    log::info!("{conn_id} subscribed to {channel}");
                                }

                                Frame::Unsubscribe { channel } => {
                                    if let Some(handle) = forwarders.remove(&channel) {
                                        handle.abort();
                                    }
                                    Self::leave_channel(
                                        conn_id, &channel, &registry, &trees, &store, &stats,
                                    )
                                    .await;
                                    log::info!("{conn_id} unsubscribed from {channel}");
                                }

                                Frame::Publish { channel, event } => {
                                    // Keep the authoritative tree current before fan-out.
                                    if parse_page_channel(&channel).is_some() {
                                        let mut trees_w = trees.write().await;
                                        if let Some(layers) = trees_w.get_mut(&channel) {
                                            if let Err(e) = Self::apply_to_tree(layers, &event) {
                                                log::warn!(
                                                    "event on {channel} rejected by authoritative tree: {e}"
                                                );
                                            }
                                        }
                                    }

                                    if let Some(group) = registry.get(&channel).await {
                                        let out = Frame::Event { channel, event };
                                        let _ = group.publish_raw(Arc::new(out.encode()?));
                                    } else {
                                        log::debug!("publish to channel with no subscribers");
                                    }
                                }

                                Frame::Ping => {
                                    ws_sender
                                        .send(Message::Binary(Frame::Pong.encode()?.into()))
                                        .await?;
                                }

                                // Server-originated frames arriving from a client
                                // are protocol misuse; drop them.
                                Frame::Event { .. } | Frame::State { .. } | Frame::Pong => {
                                    log::debug!("ignoring server-only frame from {conn_id}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {conn_id} closed");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = fan_rx.recv() => {
                    match frame {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Teardown: leave every channel this connection joined.
        for (channel, handle) in forwarders.drain() {
            handle.abort();
            Self::leave_channel(conn_id, &channel, &registry, &trees, &store, &stats).await;
        }

        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_channels = registry.channel_count().await;
        Ok(())
    }

    /// Current tree for a channel: in-memory if the room is warm,
    /// loaded from storage if cold, empty otherwise. Non-page channels
    /// have no tree.
    async fn channel_state(
        channel: &str,
        trees: &ChannelTrees,
        store: &Option<Arc<SnapshotStore>>,
    ) -> Vec<Layer> {
        let Some(page_id) = parse_page_channel(channel) else {
            return Vec::new();
        };

        let mut trees_w = trees.write().await;
        if let Some(layers) = trees_w.get(channel) {
            return layers.clone();
        }

        let layers = match store {
            Some(s) => match s.load_document(page_id) {
                Ok(layers) => {
                    log::info!("loaded persisted tree for {channel}");
                    layers
                }
                Err(crate::storage::StoreError::NotFound(_)) => Vec::new(),
                Err(e) => {
                    log::error!("failed to load tree for {channel}: {e}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        trees_w.insert(channel.to_string(), layers.clone());
        layers
    }

    /// Unregister a connection from a channel; when the channel empties,
    /// persist its tree and drop the room.
    async fn leave_channel(
        conn_id: Uuid,
        channel: &str,
        registry: &Arc<ChannelRegistry>,
        trees: &ChannelTrees,
        store: &Option<Arc<SnapshotStore>>,
        stats: &Arc<RwLock<RelayStats>>,
    ) {
        let Some(group) = registry.get(channel).await else {
            return;
        };
        group.unsubscribe(conn_id).await;
        if group.subscriber_count().await > 0 {
            return;
        }

        if let Some(page_id) = parse_page_channel(channel) {
            let layers = trees.write().await.remove(channel);
            if let (Some(store), Some(layers)) = (store, layers) {
                match store.save_document(page_id, &layers) {
                    Ok(meta) => {
                        stats.write().await.persisted_snapshots += 1;
                        log::info!("persisted {channel} at v{} (room closing)", meta.version);
                    }
                    Err(e) => log::error!("failed to persist {channel}: {e}"),
                }
            }
        }
        if registry.remove_if_empty(channel).await {
            log::info!("channel {channel} removed (empty)");
        }
    }

    /// Apply one published event to a channel's authoritative tree.
    fn apply_to_tree(
        layers: &mut Vec<Layer>,
        event: &ChannelEvent,
    ) -> Result<(), lattice_core::TreeError> {
        match event {
            ChannelEvent::LayerUpdate {
                layer_id, changes, ..
            } => tree::apply_patch(layers, *layer_id, changes),
            ChannelEvent::LayerAdded {
                parent_layer_id,
                new_layer,
                ..
            } => tree::insert(layers, *parent_layer_id, new_layer.clone()),
            ChannelEvent::LayerDeleted { layer_id, .. } => {
                tree::remove(layers, *layer_id).map(|_| ())
            }
            ChannelEvent::LayerMoved {
                layer_id,
                target_parent_id,
                target_index,
                ..
            } => tree::relocate(layers, *layer_id, *target_parent_id, *target_index),
            // Presence and component events carry no page-tree mutation.
            ChannelEvent::UserActivity { .. }
            | ChannelEvent::LockChange { .. }
            | ChannelEvent::ComponentCreated { .. }
            | ChannelEvent::ComponentUpdated { .. }
            | ChannelEvent::ComponentDeleted { .. }
            | ChannelEvent::ComponentLayersUpdated { .. } => Ok(()),
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }
}
