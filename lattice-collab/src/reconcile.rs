//! Inbound update reconciler — applies remote edits without feedback
//! loops, in receipt order, without starving the UI.
//!
//! State machine: `Idle → Draining (queue non-empty) → Idle`.
//!
//! Every inbound event is first checked against the session identity,
//! fetched fresh from the injected provider at receipt time: an event
//! carrying our own user id is our broadcast echoed back and is
//! discarded unconditionally. Surviving events join a FIFO queue that a
//! drain task empties one event per tick, so an update storm never
//! applies its whole backlog in a single turn.
//!
//! An error applying one queued event is logged and dropped; the drain
//! loop keeps going. Concurrent edits to the same field from two peers
//! resolve by last-applied-wins — there is no causal ordering beyond
//! arrival order at this client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

use lattice_core::{DocumentScope, DocumentStore, Layer};

use crate::identity::IdentityProvider;
use crate::presence::ActivityTracker;
use crate::protocol::ChannelEvent;

/// Default application cadence — one event per tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(25);

/// Counters for observing reconciler behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub echoes_discarded: u64,
    pub out_of_scope_discarded: u64,
    pub failed: u64,
}

/// Applies remote channel events to the local document store.
///
/// All collaborators are explicit constructor arguments — the store
/// handle, the identity provider, the optional presence tracker — so
/// the reconciler is unit-testable without any application bootstrap.
pub struct UpdateReconciler {
    store: Arc<RwLock<DocumentStore>>,
    identity: Arc<dyn IdentityProvider>,
    presence: Option<Arc<ActivityTracker>>,
    scope: DocumentScope,
    tick: Duration,
    queue: Mutex<VecDeque<ChannelEvent>>,
    draining: AtomicBool,
    applied: AtomicU64,
    echoes_discarded: AtomicU64,
    out_of_scope_discarded: AtomicU64,
    failed: AtomicU64,
}

impl UpdateReconciler {
    pub fn new(
        store: Arc<RwLock<DocumentStore>>,
        identity: Arc<dyn IdentityProvider>,
        scope: DocumentScope,
    ) -> Arc<Self> {
        Self::with_tick(store, identity, scope, DEFAULT_TICK)
    }

    pub fn with_tick(
        store: Arc<RwLock<DocumentStore>>,
        identity: Arc<dyn IdentityProvider>,
        scope: DocumentScope,
        tick: Duration,
    ) -> Arc<Self> {
        Self::build(store, identity, scope, tick, None)
    }

    /// Attach a presence tracker that will observe activity and lock
    /// events arriving on the channel.
    pub fn with_presence(
        store: Arc<RwLock<DocumentStore>>,
        identity: Arc<dyn IdentityProvider>,
        scope: DocumentScope,
        tick: Duration,
        presence: Arc<ActivityTracker>,
    ) -> Arc<Self> {
        Self::build(store, identity, scope, tick, Some(presence))
    }

    fn build(
        store: Arc<RwLock<DocumentStore>>,
        identity: Arc<dyn IdentityProvider>,
        scope: DocumentScope,
        tick: Duration,
        presence: Option<Arc<ActivityTracker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            identity,
            presence,
            scope,
            tick,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            applied: AtomicU64::new(0),
            echoes_discarded: AtomicU64::new(0),
            out_of_scope_discarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Feed one inbound event. Echoes and out-of-scope events are
    /// discarded here; everything else queues for the drain task.
    pub fn enqueue(self: &Arc<Self>, event: ChannelEvent) {
        // Fresh fetch, never a captured copy.
        if self.identity.current_user_id() == Some(event.user_id()) {
            self.echoes_discarded.fetch_add(1, Ordering::Relaxed);
            log::trace!("discarded own echo");
            return;
        }
        if !self.in_scope(&event) {
            self.out_of_scope_discarded.fetch_add(1, Ordering::Relaxed);
            log::debug!("discarded event outside document scope");
            return;
        }

        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);

        if !self.draining.swap(true, Ordering::SeqCst) {
            let this = self.clone();
            tokio::spawn(async move {
                this.drain().await;
            });
        }
    }

    /// Whether an event targets the document this reconciler owns.
    /// Presence events are accepted in any scope — they only reach us
    /// on a channel we subscribed to.
    fn in_scope(&self, event: &ChannelEvent) -> bool {
        if let ChannelEvent::UserActivity { .. } = event {
            return true;
        }
        match self.scope {
            DocumentScope::Page(page_id) => event.page_id() == Some(page_id),
            DocumentScope::Components => matches!(
                event,
                ChannelEvent::ComponentCreated { .. }
                    | ChannelEvent::ComponentUpdated { .. }
                    | ChannelEvent::ComponentDeleted { .. }
                    | ChannelEvent::ComponentLayersUpdated { .. }
            ),
        }
    }

    /// Drain loop: one event per tick until the queue empties.
    async fn drain(self: Arc<Self>) {
        loop {
            let event = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();

            let Some(event) = event else {
                self.draining.store(false, Ordering::SeqCst);
                // An enqueue may have raced the flag flip; reclaim the
                // drain if so, otherwise we are idle.
                let empty = self
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_empty();
                if empty || self.draining.swap(true, Ordering::SeqCst) {
                    return;
                }
                continue;
            };

            {
                let mut store = self.store.write().await;
                match self.apply(&mut store, event) {
                    Ok(()) => {
                        self.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // Local error isolation: drop this update, keep
                        // draining the rest.
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        log::warn!("failed to apply remote update: {e}");
                    }
                }
            }

            let more = !self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if more {
                tokio::time::sleep(self.tick).await;
            }
        }
    }

    /// Apply one event through the store's entry points.
    fn apply(
        &self,
        store: &mut DocumentStore,
        event: ChannelEvent,
    ) -> Result<(), lattice_core::DocumentError> {
        match event {
            ChannelEvent::LayerUpdate {
                page_id,
                layer_id,
                changes,
                ..
            } => store.update_layer(page_id, layer_id, &changes),
            ChannelEvent::LayerAdded {
                page_id,
                parent_layer_id,
                new_layer,
                ..
            } => store.add_layer_with_id(page_id, parent_layer_id, new_layer),
            ChannelEvent::LayerDeleted {
                page_id, layer_id, ..
            } => store.delete_layer(page_id, layer_id),
            ChannelEvent::LayerMoved {
                page_id,
                layer_id,
                target_parent_id,
                target_index,
                ..
            } => store.move_layer(page_id, layer_id, target_parent_id, target_index),
            ChannelEvent::ComponentCreated { component, .. } => {
                store.insert_component(component);
                Ok(())
            }
            ChannelEvent::ComponentUpdated {
                component_id, name, ..
            } => match name {
                Some(name) => store.rename_component(component_id, name),
                None => Ok(()),
            },
            ChannelEvent::ComponentDeleted { component_id, .. } => {
                if store.remove_component(component_id).is_none() {
                    log::debug!("delete for unknown component {component_id}");
                }
                Ok(())
            }
            ChannelEvent::ComponentLayersUpdated {
                component_id,
                layers,
                ..
            } => {
                store.apply_component_layers(component_id, layers);
                Ok(())
            }
            ref presence_event @ (ChannelEvent::UserActivity { .. }
            | ChannelEvent::LockChange { .. }) => {
                if let Some(tracker) = &self.presence {
                    tracker.observe(presence_event);
                }
                Ok(())
            }
        }
    }

    /// Install the initial tree from a channel `State` frame.
    pub async fn seed_page(&self, layers: Vec<Layer>) {
        if let DocumentScope::Page(page_id) = self.scope {
            self.store.write().await.set_page_layers(page_id, layers);
        }
    }

    /// Drop queued-but-unapplied events (document switch).
    pub fn cancel(&self) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Events waiting to be applied.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the drain task is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn scope(&self) -> DocumentScope {
        self.scope
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            applied: self.applied.load(Ordering::Relaxed),
            echoes_discarded: self.echoes_discarded.load(Ordering::Relaxed),
            out_of_scope_discarded: self.out_of_scope_discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::protocol::now_ms;
    use lattice_core::{Layer, LayerPatch, Page};
    use uuid::Uuid;

    fn page_store() -> (Arc<RwLock<DocumentStore>>, Uuid, Uuid) {
        let mut store = DocumentStore::new();
        let mut page = Page::new("Home");
        let layer = Layer::new("div");
        let (page_id, layer_id) = (page.id, layer.id);
        page.layers.push(layer);
        store.insert_page(page);
        (Arc::new(RwLock::new(store)), page_id, layer_id)
    }

    fn reconciler_for(
        store: Arc<RwLock<DocumentStore>>,
        local_user: Uuid,
        page_id: Uuid,
    ) -> Arc<UpdateReconciler> {
        UpdateReconciler::with_tick(
            store,
            Arc::new(StaticIdentity::new(local_user, "Local")),
            DocumentScope::Page(page_id),
            Duration::from_millis(1),
        )
    }

    fn classes_update(page_id: Uuid, layer_id: Uuid, user_id: Uuid, class: &str) -> ChannelEvent {
        ChannelEvent::LayerUpdate {
            page_id,
            layer_id,
            user_id,
            changes: LayerPatch::classes(vec![class.to_string()]),
            timestamp: now_ms(),
        }
    }

    async fn wait_idle(reconciler: &Arc<UpdateReconciler>) {
        for _ in 0..200 {
            if reconciler.pending_len() == 0 && !reconciler.is_draining() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("reconciler never went idle");
    }

    #[tokio::test]
    async fn test_own_echo_never_touches_store() {
        let (store, page_id, layer_id) = page_store();
        let local = Uuid::new_v4();
        let reconciler = reconciler_for(store.clone(), local, page_id);

        reconciler.enqueue(classes_update(page_id, layer_id, local, "p-4"));
        wait_idle(&reconciler).await;

        assert!(store
            .read()
            .await
            .layer(page_id, layer_id)
            .unwrap()
            .classes
            .is_empty());
        let stats = reconciler.stats();
        assert_eq!(stats.echoes_discarded, 1);
        assert_eq!(stats.applied, 0);
    }

    #[tokio::test]
    async fn test_fifo_application_last_write_wins() {
        let (store, page_id, layer_id) = page_store();
        let reconciler = reconciler_for(store.clone(), Uuid::new_v4(), page_id);
        let remote = Uuid::new_v4();

        reconciler.enqueue(classes_update(page_id, layer_id, remote, "p-1"));
        reconciler.enqueue(classes_update(page_id, layer_id, remote, "p-2"));
        reconciler.enqueue(classes_update(page_id, layer_id, remote, "p-3"));
        wait_idle(&reconciler).await;

        let store_r = store.read().await;
        assert_eq!(store_r.layer(page_id, layer_id).unwrap().classes, vec!["p-3"]);
        assert_eq!(reconciler.stats().applied, 3);
    }

    #[tokio::test]
    async fn test_cross_document_isolation() {
        let (store, page_id, layer_id) = page_store();
        let reconciler = reconciler_for(store.clone(), Uuid::new_v4(), page_id);

        let other_page = Uuid::new_v4();
        reconciler.enqueue(classes_update(other_page, layer_id, Uuid::new_v4(), "p-9"));
        wait_idle(&reconciler).await;

        assert!(store
            .read()
            .await
            .layer(page_id, layer_id)
            .unwrap()
            .classes
            .is_empty());
        assert_eq!(reconciler.stats().out_of_scope_discarded, 1);
    }

    #[tokio::test]
    async fn test_failed_update_does_not_halt_drain() {
        let (store, page_id, layer_id) = page_store();
        let reconciler = reconciler_for(store.clone(), Uuid::new_v4(), page_id);
        let remote = Uuid::new_v4();

        // Update to a layer that doesn't exist, then a valid one.
        reconciler.enqueue(classes_update(page_id, Uuid::new_v4(), remote, "p-1"));
        reconciler.enqueue(classes_update(page_id, layer_id, remote, "p-2"));
        wait_idle(&reconciler).await;

        let store_r = store.read().await;
        assert_eq!(store_r.layer(page_id, layer_id).unwrap().classes, vec!["p-2"]);
        let stats = reconciler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 1);
    }

    #[tokio::test]
    async fn test_structural_events_apply() {
        let (store, page_id, root_id) = page_store();
        let reconciler = reconciler_for(store.clone(), Uuid::new_v4(), page_id);
        let remote = Uuid::new_v4();

        let child = Layer::new("input");
        let child_id = child.id;
        reconciler.enqueue(ChannelEvent::LayerAdded {
            page_id,
            parent_layer_id: Some(root_id),
            new_layer: child,
            user_id: remote,
            timestamp: now_ms(),
        });
        reconciler.enqueue(ChannelEvent::LayerMoved {
            page_id,
            layer_id: child_id,
            target_parent_id: None,
            target_index: 0,
            user_id: remote,
            timestamp: now_ms(),
        });
        reconciler.enqueue(ChannelEvent::LayerDeleted {
            page_id,
            layer_id: root_id,
            user_id: remote,
            timestamp: now_ms(),
        });
        wait_idle(&reconciler).await;

        let store_r = store.read().await;
        let page = store_r.page(page_id).unwrap();
        assert_eq!(page.layers.len(), 1);
        assert_eq!(page.layers[0].id, child_id);
    }

    #[tokio::test]
    async fn test_cancel_drops_queued_events() {
        let (store, page_id, layer_id) = page_store();
        // Long tick so queued events stay queued.
        let reconciler = UpdateReconciler::with_tick(
            store.clone(),
            Arc::new(StaticIdentity::new(Uuid::new_v4(), "Local")),
            DocumentScope::Page(page_id),
            Duration::from_secs(5),
        );
        let remote = Uuid::new_v4();

        for i in 0..5 {
            reconciler.enqueue(classes_update(page_id, layer_id, remote, &format!("c{i}")));
        }
        reconciler.cancel();
        assert_eq!(reconciler.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_components_scope() {
        let store = Arc::new(RwLock::new(DocumentStore::new()));
        let reconciler = UpdateReconciler::with_tick(
            store.clone(),
            Arc::new(StaticIdentity::new(Uuid::new_v4(), "Local")),
            DocumentScope::Components,
            Duration::from_millis(1),
        );

        let component_id = Uuid::new_v4();
        reconciler.enqueue(ChannelEvent::ComponentLayersUpdated {
            component_id,
            layers: vec![Layer::new("div")],
            user_id: Uuid::new_v4(),
            timestamp: now_ms(),
        });
        // Page event must not leak into the components scope.
        reconciler.enqueue(classes_update(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "p-1",
        ));
        wait_idle(&reconciler).await;

        let store_r = store.read().await;
        assert_eq!(
            store_r.component(component_id).unwrap().layers.len(),
            1
        );
        assert_eq!(reconciler.stats().out_of_scope_discarded, 1);
    }
}
