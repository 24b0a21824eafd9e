//! Collaborator presence — "who is editing what" for a subscribed
//! channel.
//!
//! The tracker observes the presence events that arrive alongside
//! document updates: `UserActivity` announces a collaborator touching a
//! layer (possibly mid text edit), `LockChange` announces a layer being
//! claimed or released. State is held per channel and rebuilt from the
//! event stream alone, so a reconnect starts clean and repopulates as
//! peers keep broadcasting.
//!
//! Colors are derived from the user id so every client renders the same
//! collaborator in the same color without coordination.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ChannelEvent;

/// How long without activity before a collaborator drops off the list.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// RGBA color for collaborator badges and selection outlines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    /// Stable, vivid color derived from a user id.
    ///
    /// Hue comes from the id, saturation and lightness are fixed high
    /// so badges stay readable on light and dark canvases.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// One collaborator as last seen on the channel.
#[derive(Debug, Clone)]
pub struct CollaboratorActivity {
    pub user_id: Uuid,
    pub name: String,
    pub color: Color,
    /// Layer the collaborator is editing, if any.
    pub editing_layer: Option<Uuid>,
    /// Whether that edit is an in-flight text edit.
    pub text_edit: bool,
    last_seen: Instant,
}

impl CollaboratorActivity {
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        self.last_seen.elapsed() > stale_after
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

struct TrackerState {
    collaborators: HashMap<Uuid, CollaboratorActivity>,
    /// layer id → user holding the lock.
    locks: HashMap<Uuid, Uuid>,
}

/// Tracks collaborator activity and layer locks for one channel.
///
/// Shared behind an `Arc` with the reconciler, which feeds it every
/// presence event it receives.
pub struct ActivityTracker {
    state: RwLock<TrackerState>,
    stale_after: Duration,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                collaborators: HashMap::new(),
                locks: HashMap::new(),
            }),
            stale_after,
        }
    }

    /// Fold one presence event into the tracked state. Document events
    /// are ignored.
    pub fn observe(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::UserActivity {
                user_id,
                user_name,
                layer_id,
                text_edit,
                ..
            } => {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                let entry = state
                    .collaborators
                    .entry(*user_id)
                    .or_insert_with(|| CollaboratorActivity {
                        user_id: *user_id,
                        name: user_name.clone(),
                        color: Color::from_uuid(*user_id),
                        editing_layer: None,
                        text_edit: false,
                        last_seen: Instant::now(),
                    });
                if !user_name.is_empty() {
                    entry.name = user_name.clone();
                }
                entry.editing_layer = *layer_id;
                entry.text_edit = *text_edit;
                entry.last_seen = Instant::now();
            }
            ChannelEvent::LockChange {
                layer_id,
                locked_by,
                ..
            } => {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                match locked_by {
                    Some(holder) => {
                        state.locks.insert(*layer_id, *holder);
                    }
                    None => {
                        state.locks.remove(layer_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Collaborators seen within the staleness window, for rendering.
    pub fn active(&self) -> Vec<CollaboratorActivity> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .collaborators
            .values()
            .filter(|c| !c.is_stale(self.stale_after))
            .cloned()
            .collect()
    }

    /// The user holding a lock on `layer_id`, if anyone.
    pub fn lock_holder(&self, layer_id: Uuid) -> Option<Uuid> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .locks
            .get(&layer_id)
            .copied()
    }

    /// Whether `user_id` may edit `layer_id` (unlocked, or locked by
    /// them).
    pub fn can_edit(&self, layer_id: Uuid, user_id: Uuid) -> bool {
        match self.lock_holder(layer_id) {
            Some(holder) => holder == user_id,
            None => true,
        }
    }

    /// Drop collaborators that went quiet, and their locks with them.
    /// Returns the user ids removed.
    pub fn prune(&self) -> Vec<Uuid> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stale_after = self.stale_after;
        let stale: Vec<Uuid> = state
            .collaborators
            .iter()
            .filter(|(_, c)| c.is_stale(stale_after))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.collaborators.remove(id);
            state.locks.retain(|_, holder| holder != id);
        }
        stale
    }

    pub fn collaborator_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .collaborators
            .len()
    }

    /// Forget everything (document switch).
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.collaborators.clear();
        state.locks.clear();
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
