//! Auto-saving draft manager for component edits.
//!
//! Component edits land in a per-component draft first. Every edit
//! replaces the draft wholesale and re-arms a single save timer; the
//! save fires only after the edit burst goes quiet. The persisted
//! canonical tree returned by the backend is committed to the document
//! store, which refreshes every placed instance of the component.
//!
//! Save race: edits can arrive while a save is in flight. Each edit
//! bumps the draft's revision, and the revision captured at save start
//! is compared after the backend answers. A match means the save
//! covered everything, so the draft is clean and a version snapshot is
//! recorded. A mismatch means the draft diverged mid-save: it stays
//! dirty, no snapshot is taken, and the already re-armed timer will
//! save again. Either way the saved signal goes out, since the
//! committed canonical tree did change.
//!
//! A failed save is logged and the draft kept dirty; nothing surfaces
//! to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use lattice_core::{DocumentStore, Layer};

use crate::versions::VersionTracker;

/// Default quiet period before a dirty draft is saved.
pub const DEFAULT_SAVE_WINDOW: Duration = Duration::from_millis(500);

/// Persistence failure for a draft save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// Request never produced an answer (network, timeout).
    Transport(String),
    /// Backend answered with a non-success status.
    Rejected { status: u16, message: String },
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Transport(msg) => write!(f, "transport error: {msg}"),
            PersistError::Rejected { status, message } => {
                write!(f, "save rejected ({status}): {message}")
            }
        }
    }
}

impl std::error::Error for PersistError {}

/// Backend that persists a component tree and returns the canonical
/// tree as stored.
pub trait ComponentPersistence: Send + Sync + 'static {
    fn save_component<'a>(
        &'a self,
        id: Uuid,
        layers: Vec<Layer>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Layer>, PersistError>> + Send + 'a>>;
}

struct DraftEntry {
    layers: Vec<Layer>,
    /// Bumped on every edit; save-race detection compares this.
    revision: u64,
    dirty: bool,
    saving: bool,
    timer: Option<tokio::task::JoinHandle<()>>,
}

/// Debounced auto-save pipeline for component drafts.
pub struct DraftManager {
    store: Arc<RwLock<DocumentStore>>,
    persistence: Arc<dyn ComponentPersistence>,
    versions: Option<Arc<dyn VersionTracker>>,
    save_window: Duration,
    drafts: Mutex<HashMap<Uuid, DraftEntry>>,
    saved_tx: broadcast::Sender<Uuid>,
}

impl DraftManager {
    pub fn new(
        store: Arc<RwLock<DocumentStore>>,
        persistence: Arc<dyn ComponentPersistence>,
    ) -> Arc<Self> {
        Self::with_options(store, persistence, DEFAULT_SAVE_WINDOW, None)
    }

    pub fn with_options(
        store: Arc<RwLock<DocumentStore>>,
        persistence: Arc<dyn ComponentPersistence>,
        save_window: Duration,
        versions: Option<Arc<dyn VersionTracker>>,
    ) -> Arc<Self> {
        let (saved_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            store,
            persistence,
            versions,
            save_window,
            drafts: Mutex::new(HashMap::new()),
            saved_tx,
        })
    }

    /// Replace the draft for `component_id` and re-arm its save timer.
    ///
    /// Synchronous and cheap: the layers move into the draft, the
    /// revision bumps, and the previous timer (if any) is aborted so a
    /// burst of edits produces one save after the window of quiet.
    pub fn update_draft(self: &Arc<Self>, component_id: Uuid, layers: Vec<Layer>) {
        let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = drafts.entry(component_id).or_insert_with(|| DraftEntry {
            layers: Vec::new(),
            revision: 0,
            dirty: false,
            saving: false,
            timer: None,
        });
        entry.layers = layers;
        entry.revision += 1;
        entry.dirty = true;

        if let Some(previous) = entry.timer.take() {
            previous.abort();
        }
        let this = self.clone();
        let window = self.save_window;
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.save_draft(component_id).await;
        }));
    }

    /// Persist the current draft for `component_id` immediately.
    ///
    /// Called by the armed timer; also usable to force a save (e.g. on
    /// editor close).
    pub async fn save_draft(self: &Arc<Self>, component_id: Uuid) {
        // Snapshot under the lock, never hold it across the await.
        let (layers, revision) = {
            let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = drafts.get_mut(&component_id) else {
                return;
            };
            if !entry.dirty {
                return;
            }
            entry.saving = true;
            (entry.layers.clone(), entry.revision)
        };

        let result = self.persistence.save_component(component_id, layers).await;

        match result {
            Ok(canonical) => {
                let unchanged = {
                    let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
                    match drafts.get_mut(&component_id) {
                        Some(entry) => {
                            entry.saving = false;
                            let unchanged = entry.revision == revision;
                            if unchanged {
                                entry.dirty = false;
                            }
                            unchanged
                        }
                        // Draft cleared mid-save; still commit what the
                        // backend stored.
                        None => true,
                    }
                };

                self.store
                    .write()
                    .await
                    .apply_component_layers(component_id, canonical.clone());

                if unchanged {
                    if let Some(versions) = &self.versions {
                        versions.record(component_id, &canonical);
                    }
                    log::debug!("component {component_id} saved");
                } else {
                    // A newer draft is already waiting on its timer;
                    // its save records the version.
                    log::debug!(
                        "component {component_id} edited during save; snapshot skipped"
                    );
                }
                let _ = self.saved_tx.send(component_id);
            }
            Err(e) => {
                let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = drafts.get_mut(&component_id) {
                    entry.saving = false;
                }
                // Draft stays dirty; the next edit re-arms the timer.
                log::error!("failed to save component {component_id}: {e}");
            }
        }
    }

    /// Drop the draft and cancel its pending save (editor close,
    /// component deleted).
    pub fn clear_draft(&self, component_id: Uuid) {
        let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = drafts.remove(&component_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Cancel every pending save (session teardown).
    pub fn clear_all(&self) {
        let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in drafts.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Current draft tree, if one exists.
    pub fn draft(&self, component_id: Uuid) -> Option<Vec<Layer>> {
        self.drafts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&component_id)
            .map(|e| e.layers.clone())
    }

    pub fn is_dirty(&self, component_id: Uuid) -> bool {
        self.drafts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&component_id)
            .map(|e| e.dirty)
            .unwrap_or(false)
    }

    pub fn is_saving(&self, component_id: Uuid) -> bool {
        self.drafts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&component_id)
            .map(|e| e.saving)
            .unwrap_or(false)
    }

    /// Receive the id of each component whose canonical tree was
    /// committed by a save.
    pub fn subscribe_saved(&self) -> broadcast::Receiver<Uuid> {
        self.saved_tx.subscribe()
    }

    pub fn save_window(&self) -> Duration {
        self.save_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::InMemoryVersionLog;
    use lattice_core::{Component, DocumentStore, Page};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct MockPersistence {
        calls: AtomicUsize,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    impl MockPersistence {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                gate: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(true),
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                gate: Some(gate),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ComponentPersistence for MockPersistence {
        fn save_component<'a>(
            &'a self,
            _id: Uuid,
            layers: Vec<Layer>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Layer>, PersistError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                if self.fail.load(Ordering::SeqCst) {
                    Err(PersistError::Transport("mock failure".into()))
                } else {
                    Ok(layers)
                }
            })
        }
    }

    fn tree(class: &str) -> Vec<Layer> {
        let mut layer = Layer::new("div");
        layer.classes.push(class.to_string());
        vec![layer]
    }

    fn store_with_component(id: Uuid) -> Arc<RwLock<DocumentStore>> {
        let mut store = DocumentStore::new();
        store.insert_component(Component::with_id(id, "Card", Vec::new()));
        Arc::new(RwLock::new(store))
    }

    #[tokio::test]
    async fn test_edit_burst_saves_once() {
        let id = Uuid::new_v4();
        let persistence = MockPersistence::ok();
        let manager = DraftManager::with_options(
            store_with_component(id),
            persistence.clone(),
            Duration::from_millis(30),
            None,
        );

        for i in 0..5 {
            manager.update_draft(id, tree(&format!("v{i}")));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(persistence.calls(), 1);
        assert!(!manager.is_dirty(id));
    }

    #[tokio::test]
    async fn test_clean_save_commits_and_records_version() {
        let id = Uuid::new_v4();
        let store = store_with_component(id);
        let versions = Arc::new(InMemoryVersionLog::new());
        let manager = DraftManager::with_options(
            store.clone(),
            MockPersistence::ok(),
            Duration::from_millis(10),
            Some(versions.clone()),
        );
        let mut saved = manager.subscribe_saved();

        manager.update_draft(id, tree("final"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(saved.try_recv(), Ok(id));
        assert_eq!(versions.depth(id), 1);
        let store_r = store.read().await;
        assert_eq!(store_r.component(id).unwrap().layers[0].classes, vec!["final"]);
    }

    #[tokio::test]
    async fn test_save_commit_refreshes_placed_instances() {
        let component_id = Uuid::new_v4();
        let store = store_with_component(component_id);
        let (page_id, instance_id) = {
            let mut store_w = store.write().await;
            let mut page = Page::new("Home");
            let instance = Layer::new("instance");
            let (page_id, instance_id) = (page.id, instance.id);
            page.layers.push(instance);
            store_w.insert_page(page);
            store_w.register_instance(page_id, instance_id, component_id);
            (page_id, instance_id)
        };

        let manager = DraftManager::with_options(
            store.clone(),
            MockPersistence::ok(),
            Duration::from_millis(10),
            None,
        );
        manager.update_draft(component_id, tree("fresh"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let store_r = store.read().await;
        let instance = store_r.layer(page_id, instance_id).unwrap();
        assert_eq!(instance.children[0].classes, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_draft_dirty() {
        let id = Uuid::new_v4();
        let persistence = MockPersistence::failing();
        let manager = DraftManager::with_options(
            store_with_component(id),
            persistence.clone(),
            Duration::from_millis(10),
            None,
        );
        let mut saved = manager.subscribe_saved();

        manager.update_draft(id, tree("v1"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(persistence.calls(), 1);
        assert!(manager.is_dirty(id));
        assert!(!manager.is_saving(id));
        assert!(saved.try_recv().is_err());
        assert_eq!(manager.draft(id).unwrap()[0].classes, vec!["v1"]);
    }

    #[tokio::test]
    async fn test_edit_during_save_skips_snapshot_and_stays_dirty() {
        let id = Uuid::new_v4();
        let gate = Arc::new(Notify::new());
        let persistence = MockPersistence::gated(gate.clone());
        let versions = Arc::new(InMemoryVersionLog::new());
        let manager = DraftManager::with_options(
            store_with_component(id),
            persistence.clone(),
            Duration::from_secs(60),
            Some(versions.clone()),
        );

        manager.update_draft(id, tree("v1"));
        let saving = {
            let m = manager.clone();
            tokio::spawn(async move { m.save_draft(id).await })
        };
        // Wait until the save is actually in flight.
        for _ in 0..100 {
            if manager.is_saving(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(manager.is_saving(id));

        // Diverge the draft mid-save, then let the save finish.
        manager.update_draft(id, tree("v2"));
        gate.notify_one();
        saving.await.unwrap();

        assert!(manager.is_dirty(id));
        assert_eq!(versions.depth(id), 0);

        // The follow-up save covers v2 and completes clean.
        manager.save_draft(id).await;
        assert!(!manager.is_dirty(id));
        assert_eq!(versions.depth(id), 1);
        assert_eq!(persistence.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_draft_cancels_pending_save() {
        let id = Uuid::new_v4();
        let persistence = MockPersistence::ok();
        let manager = DraftManager::with_options(
            store_with_component(id),
            persistence.clone(),
            Duration::from_millis(20),
            None,
        );

        manager.update_draft(id, tree("v1"));
        manager.clear_draft(id);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(persistence.calls(), 0);
        assert!(manager.draft(id).is_none());
    }

    #[tokio::test]
    async fn test_save_without_draft_is_a_no_op() {
        let persistence = MockPersistence::ok();
        let manager = DraftManager::with_options(
            Arc::new(RwLock::new(DocumentStore::new())),
            persistence.clone(),
            Duration::from_millis(10),
            None,
        );

        manager.save_draft(Uuid::new_v4()).await;
        assert_eq!(persistence.calls(), 0);
    }
}
