//! # lattice-core — layer-tree document model
//!
//! The shared document of the visual builder: pages and components as
//! trees of [`Layer`] nodes, mutated through the [`DocumentStore`]'s
//! four entry points and addressed everywhere by immutable layer ids.
//!
//! ## Modules
//!
//! - [`layer`] — `Layer`, typed `Variable` bindings, `LayerPatch`
//!   shallow merge (last-write-wins per field)
//! - [`tree`] — the one tree-traversal utility
//! - [`document`] — `DocumentStore`, `Page`, `Component`, scope guard

pub mod document;
pub mod layer;
pub mod tree;

pub use document::{Component, DocumentError, DocumentScope, DocumentStore, Page};
pub use layer::{
    AttrValue, Breakpoint, DesignProps, Layer, LayerPatch, LinkSettings, StyleState, Variable,
};
pub use tree::TreeError;
