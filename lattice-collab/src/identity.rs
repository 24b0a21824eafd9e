//! Session identity, injected rather than read from ambient globals.
//!
//! The user id exists purely for echo suppression — telling "my own
//! broadcast echoed back" apart from a genuine remote edit. It is not a
//! security boundary. Consumers must fetch it at use time, never
//! capture it in a closure: after a reconnection the id can change
//! between when a timer was armed and when it fires.

use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Provides the current session identity at call time.
pub trait IdentityProvider: Send + Sync + 'static {
    /// The current user id, or `None` before sign-in completes.
    fn current_user_id(&self) -> Option<Uuid>;

    /// Display name for presence. Defaults to empty.
    fn current_user_name(&self) -> String {
        String::new()
    }
}

/// Fixed identity (tests, single-user tools).
pub struct StaticIdentity {
    user_id: Uuid,
    name: String,
}

impl StaticIdentity {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<Uuid> {
        Some(self.user_id)
    }

    fn current_user_name(&self) -> String {
        self.name.clone()
    }
}

/// Swappable identity — the live session store of a real host app.
#[derive(Default)]
pub struct SharedIdentity {
    inner: Arc<RwLock<Option<(Uuid, String)>>>,
}

impl SharedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the signed-in user.
    pub fn set(&self, user_id: Uuid, name: impl Into<String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = Some((user_id, name.into()));
    }

    /// Clear on sign-out.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = None;
    }
}

impl IdentityProvider for SharedIdentity {
    fn current_user_id(&self) -> Option<Uuid> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(id, _)| *id)
    }

    fn current_user_name(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, name)| name.clone())
            .unwrap_or_default()
    }
}
