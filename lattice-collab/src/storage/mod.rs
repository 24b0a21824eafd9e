//! Persistent storage for the relay's authoritative document trees.
//!
//! A room's layer tree is persisted as one LZ4-compressed bincode
//! snapshot when the last subscriber leaves, and loaded back the next
//! time someone subscribes. There is no delta log: the document model
//! is whole-tree last-write-wins, so the latest snapshot is the whole
//! story.

pub mod rocks;

pub use rocks::{SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
