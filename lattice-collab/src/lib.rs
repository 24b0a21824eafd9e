//! # lattice-collab — Live collaborative update pipeline for Lattice
//!
//! Carries layer edits between editors in real time over a channel
//! relay, reconciles inbound updates into the local document store,
//! and auto-saves component drafts to the backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐    WebSocket     ┌─────────────────┐
//! │ ChannelSession │ ◄──────────────► │  RelayServer    │
//! │ (per channel)  │   Frame (bin)    │  (central)      │
//! └───┬────────┬───┘                  └────────┬────────┘
//!     │        │                               │
//!     ▼        ▼                       ┌───────┴────────┐
//! ┌────────┐ ┌──────────────────┐      │ ChannelRegistry│
//! │Debounce│ │ UpdateReconciler │      │ (fan-out)      │
//! │(100ms) │ │ (one per tick)   │      └───────┬────────┘
//! └────────┘ └────────┬─────────┘              ▼
//!                     ▼                ┌────────────────┐
//!            ┌────────────────┐        │ SnapshotStore  │
//!            │ DocumentStore  │        │ (RocksDB+LZ4)  │
//!            └────────────────┘        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol ([`Frame`] / [`ChannelEvent`])
//! - [`session`] — Per-channel client session with debounced broadcast
//! - [`reconcile`] — Inbound queue, echo suppression, paced apply
//! - [`outbound`] — Trailing-edge debouncer
//! - [`draft`] — Auto-saving component drafts with save-race handling
//! - [`versions`] — Per-component version history
//! - [`presence`] — Collaborator activity and layer locks
//! - [`identity`] — Injected session identity
//! - [`broadcast`] — Channel fan-out groups for the relay
//! - [`server`] — WebSocket relay server
//! - [`storage`] — Compressed document snapshots (RocksDB)
//! - [`api`] — REST persistence and realtime config

pub mod api;
pub mod broadcast;
pub mod draft;
pub mod identity;
pub mod outbound;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod storage;
pub mod versions;

pub use api::{ConfigCache, HttpPersistence, RealtimeConfig};
pub use broadcast::{ChannelGroup, ChannelRegistry, ChannelStats};
pub use draft::{ComponentPersistence, DraftManager, PersistError};
pub use identity::{IdentityProvider, SharedIdentity, StaticIdentity};
pub use outbound::Debouncer;
pub use presence::{ActivityTracker, CollaboratorActivity, Color};
pub use protocol::{
    page_channel, parse_page_channel, ChannelEvent, Frame, ProtocolError, COMPONENTS_CHANNEL,
};
pub use reconcile::{ReconcilerStats, UpdateReconciler};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::ChannelSession;
pub use storage::{SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
pub use versions::{InMemoryVersionLog, VersionTracker};
