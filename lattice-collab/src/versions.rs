//! Version history for component trees.
//!
//! Each clean auto-save pushes a snapshot onto that component's undo
//! stack. A snapshot is a full deep copy of the layer tree — at typical
//! component sizes a copy is cheaper and far simpler than a diff chain,
//! and undo becomes a plain pop.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use lattice_core::Layer;

/// Snapshots kept per component before old history is discarded.
pub const DEFAULT_HISTORY_CAP: usize = 64;

/// Sink for post-save snapshots.
///
/// The draft manager records through this trait so tests can observe
/// history without a real log, and hosts can plug in persistent
/// history later.
pub trait VersionTracker: Send + Sync + 'static {
    /// Record the canonical tree that was just saved for `id`.
    fn record(&self, id: Uuid, layers: &[Layer]);
}

struct History {
    undo: Vec<Vec<Layer>>,
    redo: Vec<Vec<Layer>>,
}

/// In-memory per-component undo/redo log.
pub struct InMemoryVersionLog {
    histories: Mutex<HashMap<Uuid, History>>,
    cap: usize,
}

impl InMemoryVersionLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Pop the latest snapshot for `id`, moving it to the redo stack.
    pub fn undo(&self, id: Uuid) -> Option<Vec<Layer>> {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories.get_mut(&id)?;
        let snapshot = history.undo.pop()?;
        history.redo.push(snapshot);
        // The new top of the undo stack is the state to restore.
        history.undo.last().cloned()
    }

    /// Re-apply the most recently undone snapshot for `id`.
    pub fn redo(&self, id: Uuid) -> Option<Vec<Layer>> {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories.get_mut(&id)?;
        let snapshot = history.redo.pop()?;
        history.undo.push(snapshot.clone());
        Some(snapshot)
    }

    /// Snapshots currently on the undo stack for `id`.
    pub fn depth(&self, id: Uuid) -> usize {
        self.histories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|h| h.undo.len())
            .unwrap_or(0)
    }

    /// Drop all history for `id`.
    pub fn forget(&self, id: Uuid) {
        self.histories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

impl Default for InMemoryVersionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionTracker for InMemoryVersionLog {
    fn record(&self, id: Uuid, layers: &[Layer]) {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories.entry(id).or_insert_with(|| History {
            undo: Vec::new(),
            redo: Vec::new(),
        });
        history.undo.push(layers.to_vec());
        // A fresh save invalidates anything undone past this point.
        history.redo.clear();
        if history.undo.len() > self.cap {
            let overflow = history.undo.len() - self.cap;
            history.undo.drain(..overflow);
        }
    }
}
