//! Channel session — one live subscription to a document's update
//! channel.
//!
//! A session owns the WebSocket link to the relay, the outbound
//! debouncer, and the inbound reconciler for exactly one channel. The
//! subscription is acknowledged by the relay's `State` frame; until it
//! arrives every broadcast method is a silent no-op, and after
//! [`ChannelSession::close`] they are again. Callers never branch on
//! readiness.
//!
//! Outbound property edits go through the debouncer, which reads the
//! identity fresh when the timer fires. Structural edits (add, delete,
//! move) and component lifecycle events skip the debouncer and send
//! immediately. Every broadcast is paired with a `UserActivity` event
//! so presence rides the same pipe as the edits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use lattice_core::{Component, DocumentScope, DocumentStore, Layer, LayerPatch};

use crate::identity::IdentityProvider;
use crate::outbound::{Debouncer, DEFAULT_BROADCAST_WINDOW};
use crate::protocol::{
    now_ms, page_channel, ChannelEvent, Frame, ProtocolError, COMPONENTS_CHANNEL,
};
use crate::reconcile::UpdateReconciler;

/// Channel name for a document scope.
pub fn channel_for(scope: DocumentScope) -> String {
    match scope {
        DocumentScope::Page(page_id) => page_channel(page_id),
        DocumentScope::Components => COMPONENTS_CHANNEL.to_string(),
    }
}

/// Instruction for the writer task. `Shutdown` acks once every frame
/// queued before it has been written to the socket.
enum WriterCommand {
    Frame(Vec<u8>),
    Shutdown(oneshot::Sender<()>),
}

/// A live subscription to one update channel.
pub struct ChannelSession {
    channel: String,
    scope: DocumentScope,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<RwLock<DocumentStore>>,
    reconciler: Arc<UpdateReconciler>,
    outgoing_tx: mpsc::Sender<WriterCommand>,
    subscribed: Arc<AtomicBool>,
    debouncer: Debouncer<(Uuid, LayerPatch)>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelSession {
    /// Connect to the relay and subscribe to the channel for `scope`.
    ///
    /// Returns as soon as the link is up; the subscription completes
    /// when the relay's `State` frame arrives, at which point
    /// broadcasts start going out and the reconciler has been seeded
    /// with the channel's current tree.
    pub async fn open(
        url: &str,
        scope: DocumentScope,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<RwLock<DocumentStore>>,
        reconciler: Arc<UpdateReconciler>,
    ) -> Result<Arc<Self>, ProtocolError> {
        Self::open_with_window(url, scope, identity, store, reconciler, DEFAULT_BROADCAST_WINDOW)
            .await
    }

    pub async fn open_with_window(
        url: &str,
        scope: DocumentScope,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<RwLock<DocumentStore>>,
        reconciler: Arc<UpdateReconciler>,
        window: Duration,
    ) -> Result<Arc<Self>, ProtocolError> {
        let channel = channel_for(scope);

        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            log::error!("failed to connect to relay at {url}: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<WriterCommand>(256);
        let writer_handle = tokio::spawn(async move {
            while let Some(command) = outgoing_rx.recv().await {
                match command {
                    WriterCommand::Frame(bytes) => {
                        if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    WriterCommand::Shutdown(ack) => {
                        let _ = ws_writer.close().await;
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        });

        let subscribed = Arc::new(AtomicBool::new(false));

        // Reader: seed on State (the subscribe ack), feed Events to the
        // reconciler, answer Pings.
        let reader_handle = {
            let channel = channel.clone();
            let subscribed = subscribed.clone();
            let reconciler = reconciler.clone();
            let outgoing_tx = outgoing_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(bytes)) => {
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("undecodable frame from relay: {e}");
                                    continue;
                                }
                            };
                            match frame {
                                Frame::State { channel: ch, layers } if ch == channel => {
                                    reconciler.seed_page(layers).await;
                                    subscribed.store(true, Ordering::SeqCst);
                                    log::debug!("subscribed to {channel}");
                                }
                                Frame::Event { channel: ch, event } if ch == channel => {
                                    reconciler.enqueue(event);
                                }
                                Frame::Ping => {
                                    if let Ok(pong) = Frame::Pong.encode() {
                                        let _ = outgoing_tx.try_send(WriterCommand::Frame(pong));
                                    }
                                }
                                _ => {}
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                subscribed.store(false, Ordering::SeqCst);
            })
        };

        // Debouncer fire: read identity and readiness at fire time, so
        // a sign-out or teardown inside the window suppresses the send
        // and a reconnect sends with the fresh id.
        let debouncer = {
            let channel = channel.clone();
            let identity = identity.clone();
            let subscribed = subscribed.clone();
            let outgoing_tx = outgoing_tx.clone();
            let page_id = match scope {
                DocumentScope::Page(id) => Some(id),
                DocumentScope::Components => None,
            };
            Debouncer::new(window, move |(layer_id, changes): (Uuid, LayerPatch)| {
                if !subscribed.load(Ordering::SeqCst) {
                    return;
                }
                let Some(page_id) = page_id else { return };
                let Some(user_id) = identity.current_user_id() else {
                    return;
                };
                let text_edit = changes.is_text_edit();
                let update = Frame::Publish {
                    channel: channel.clone(),
                    event: ChannelEvent::LayerUpdate {
                        page_id,
                        layer_id,
                        user_id,
                        changes,
                        timestamp: now_ms(),
                    },
                };
                let activity = Frame::Publish {
                    channel: channel.clone(),
                    event: ChannelEvent::UserActivity {
                        user_id,
                        user_name: identity.current_user_name(),
                        layer_id: Some(layer_id),
                        text_edit,
                        timestamp: now_ms(),
                    },
                };
                for frame in [update, activity] {
                    match frame.encode() {
                        Ok(bytes) => {
                            let _ = outgoing_tx.try_send(WriterCommand::Frame(bytes));
                        }
                        Err(e) => log::warn!("failed to encode outbound frame: {e}"),
                    }
                }
            })
        };

        let session = Arc::new(Self {
            channel: channel.clone(),
            scope,
            identity,
            store,
            reconciler,
            outgoing_tx,
            subscribed,
            debouncer,
            reader: Mutex::new(Some(reader_handle)),
            writer: Mutex::new(Some(writer_handle)),
        });

        let subscribe = Frame::Subscribe { channel }.encode()?;
        session
            .outgoing_tx
            .send(WriterCommand::Frame(subscribe))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        Ok(session)
    }

    /// Whether the relay has acknowledged the subscription.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn scope(&self) -> DocumentScope {
        self.scope
    }

    fn page_id(&self) -> Option<Uuid> {
        match self.scope {
            DocumentScope::Page(id) => Some(id),
            DocumentScope::Components => None,
        }
    }

    /// Encode and send one event. Silent no-op before the subscribe
    /// ack and after teardown.
    fn publish(&self, event: ChannelEvent) {
        if !self.subscribed.load(Ordering::SeqCst) {
            return;
        }
        let frame = Frame::Publish {
            channel: self.channel.clone(),
            event,
        };
        match frame.encode() {
            Ok(bytes) => {
                let _ = self.outgoing_tx.try_send(WriterCommand::Frame(bytes));
            }
            Err(e) => log::warn!("failed to encode outbound frame: {e}"),
        }
    }

    fn publish_activity(&self, user_id: Uuid, layer_id: Option<Uuid>, text_edit: bool) {
        self.publish(ChannelEvent::UserActivity {
            user_id,
            user_name: self.identity.current_user_name(),
            layer_id,
            text_edit,
            timestamp: now_ms(),
        });
    }

    /// Debounced property-edit broadcast. A burst of calls inside the
    /// window produces one send carrying the last patch.
    pub fn broadcast_layer_update(&self, layer_id: Uuid, changes: LayerPatch) {
        if !self.subscribed.load(Ordering::SeqCst) {
            return;
        }
        self.debouncer.call((layer_id, changes));
    }

    /// Apply a patch locally, then broadcast it (debounced).
    pub async fn apply_local_update(&self, layer_id: Uuid, changes: LayerPatch) {
        if let Some(page_id) = self.page_id() {
            let result = self
                .store
                .write()
                .await
                .update_layer(page_id, layer_id, &changes);
            if let Err(e) = result {
                log::warn!("local update failed: {e}");
                return;
            }
        }
        self.broadcast_layer_update(layer_id, changes);
    }

    /// Immediate broadcast of a layer insertion.
    pub fn broadcast_layer_added(&self, parent_layer_id: Option<Uuid>, new_layer: Layer) {
        let (Some(page_id), Some(user_id)) = (self.page_id(), self.identity.current_user_id())
        else {
            return;
        };
        let layer_id = new_layer.id;
        self.publish(ChannelEvent::LayerAdded {
            page_id,
            parent_layer_id,
            new_layer,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, Some(layer_id), false);
    }

    /// Immediate broadcast of a layer deletion.
    pub fn broadcast_layer_deleted(&self, layer_id: Uuid) {
        let (Some(page_id), Some(user_id)) = (self.page_id(), self.identity.current_user_id())
        else {
            return;
        };
        self.publish(ChannelEvent::LayerDeleted {
            page_id,
            layer_id,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, None, false);
    }

    /// Immediate broadcast of a layer move.
    pub fn broadcast_layer_moved(
        &self,
        layer_id: Uuid,
        target_parent_id: Option<Uuid>,
        target_index: usize,
    ) {
        let (Some(page_id), Some(user_id)) = (self.page_id(), self.identity.current_user_id())
        else {
            return;
        };
        self.publish(ChannelEvent::LayerMoved {
            page_id,
            layer_id,
            target_parent_id,
            target_index,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, Some(layer_id), false);
    }

    /// Immediate broadcast of a lock claim or release.
    pub fn broadcast_lock_change(&self, layer_id: Uuid, locked_by: Option<Uuid>) {
        let (Some(page_id), Some(user_id)) = (self.page_id(), self.identity.current_user_id())
        else {
            return;
        };
        self.publish(ChannelEvent::LockChange {
            page_id,
            layer_id,
            locked_by,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, Some(layer_id), false);
    }

    /// Immediate broadcast of a new component (components channel).
    pub fn broadcast_component_created(&self, component: Component) {
        let Some(user_id) = self.identity.current_user_id() else {
            return;
        };
        self.publish(ChannelEvent::ComponentCreated {
            component,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, None, false);
    }

    /// Immediate broadcast of a component rename.
    pub fn broadcast_component_updated(&self, component_id: Uuid, name: Option<String>) {
        let Some(user_id) = self.identity.current_user_id() else {
            return;
        };
        self.publish(ChannelEvent::ComponentUpdated {
            component_id,
            name,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, None, false);
    }

    /// Immediate broadcast of a component deletion.
    pub fn broadcast_component_deleted(&self, component_id: Uuid) {
        let Some(user_id) = self.identity.current_user_id() else {
            return;
        };
        self.publish(ChannelEvent::ComponentDeleted {
            component_id,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, None, false);
    }

    /// Immediate broadcast of a component's saved canonical layers.
    pub fn broadcast_component_layers(&self, component_id: Uuid, layers: Vec<Layer>) {
        let Some(user_id) = self.identity.current_user_id() else {
            return;
        };
        self.publish(ChannelEvent::ComponentLayersUpdated {
            component_id,
            layers,
            user_id,
            timestamp: now_ms(),
        });
        self.publish_activity(user_id, None, false);
    }

    /// Tear the session down: unsubscribe, cancel the pending debounce
    /// timer, drop queued inbound events, stop the link tasks. Every
    /// broadcast method afterwards is a silent no-op.
    pub async fn close(&self) {
        self.subscribed.store(false, Ordering::SeqCst);
        self.debouncer.cancel();
        self.reconciler.cancel();

        if let Ok(bytes) = (Frame::Unsubscribe {
            channel: self.channel.clone(),
        })
        .encode()
        {
            let _ = self.outgoing_tx.send(WriterCommand::Frame(bytes)).await;
        }
        // The writer drains the queue in order, so the ack means the
        // unsubscribe is on the wire.
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .outgoing_tx
            .send(WriterCommand::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            handle.abort();
        }
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        log::debug!("closed session on {}", self.channel);
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.subscribed.store(false, Ordering::SeqCst);
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            handle.abort();
        }
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = writer {
            handle.abort();
        }
    }
}
