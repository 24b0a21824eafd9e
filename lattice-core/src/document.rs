//! Document store — the single mutable resource of the editor.
//!
//! Holds the current draft tree of every open page and component, keyed
//! by id. Both local-edit code paths and remote-reconciliation code
//! paths mutate it through the same four entry points (`update_layer`,
//! `add_layer_with_id`, `delete_layer`, `move_layer`); each call is
//! atomic at the runtime-turn granularity, so "last call wins" is the
//! consistency guarantee.

use crate::layer::{Layer, LayerPatch};
use crate::tree::{self, TreeError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Which document a mutation or inbound event targets.
///
/// Layer-level operations are always page-scoped; the global components
/// scope carries whole-tree component events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentScope {
    Page(Uuid),
    Components,
}

/// Document store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    PageNotFound(Uuid),
    ComponentNotFound(Uuid),
    Tree(TreeError),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::PageNotFound(id) => write!(f, "page not found: {id}"),
            DocumentError::ComponentNotFound(id) => write!(f, "component not found: {id}"),
            DocumentError::Tree(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

impl From<TreeError> for DocumentError {
    fn from(e: TreeError) -> Self {
        DocumentError::Tree(e)
    }
}

/// One page of the site: a layer tree plus the component instances
/// embedded in it (`instance layer id → component id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub name: String,
    pub layers: Vec<Layer>,
    pub component_instances: BTreeMap<Uuid, Uuid>,
}

impl Page {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            layers: Vec::new(),
            component_instances: BTreeMap::new(),
        }
    }
}

/// A named, reusable layer subtree stored independently of any page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: Uuid,
    pub name: String,
    pub layers: Vec<Layer>,
}

impl Component {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self::with_id(Uuid::new_v4(), name, layers)
    }

    pub fn with_id(id: Uuid, name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            id,
            name: name.into(),
            layers,
        }
    }
}

/// In-memory tree of layers per page/component.
#[derive(Debug, Default)]
pub struct DocumentStore {
    pages: HashMap<Uuid, Page>,
    components: HashMap<Uuid, Component>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Pages ───────────────────────────────────────────────────────

    pub fn insert_page(&mut self, page: Page) {
        self.pages.insert(page.id, page);
    }

    pub fn page(&self, id: Uuid) -> Option<&Page> {
        self.pages.get(&id)
    }

    pub fn remove_page(&mut self, id: Uuid) -> Option<Page> {
        self.pages.remove(&id)
    }

    /// Replace a page's entire layer tree (initial channel state).
    /// Creates the page if this client has never seen it.
    pub fn set_page_layers(&mut self, page_id: Uuid, layers: Vec<Layer>) {
        let page = self.pages.entry(page_id).or_insert_with(|| Page {
            id: page_id,
            name: String::new(),
            layers: Vec::new(),
            component_instances: BTreeMap::new(),
        });
        page.layers = layers;
    }

    /// Mark a layer of a page as an instance of a component.
    pub fn register_instance(
        &mut self,
        page_id: Uuid,
        layer_id: Uuid,
        component_id: Uuid,
    ) -> Result<(), DocumentError> {
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(DocumentError::PageNotFound(page_id))?;
        if !tree::contains(&page.layers, layer_id) {
            return Err(TreeError::LayerNotFound(layer_id).into());
        }
        page.component_instances.insert(layer_id, component_id);
        Ok(())
    }

    // ── Layer operations ────────────────────────────────────────────

    /// Merge a shallow patch into the addressed layer. Synchronous;
    /// callers see the change on the very next read.
    pub fn update_layer(
        &mut self,
        page_id: Uuid,
        layer_id: Uuid,
        patch: &LayerPatch,
    ) -> Result<(), DocumentError> {
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(DocumentError::PageNotFound(page_id))?;
        tree::apply_patch(&mut page.layers, layer_id, patch)?;
        Ok(())
    }

    /// Add a layer that already carries its id (local adds mint the id
    /// before broadcasting so remote peers insert the same one).
    pub fn add_layer_with_id(
        &mut self,
        page_id: Uuid,
        parent_layer_id: Option<Uuid>,
        layer: Layer,
    ) -> Result<(), DocumentError> {
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(DocumentError::PageNotFound(page_id))?;
        tree::insert(&mut page.layers, parent_layer_id, layer)?;
        Ok(())
    }

    /// Delete a layer and its subtree.
    pub fn delete_layer(&mut self, page_id: Uuid, layer_id: Uuid) -> Result<(), DocumentError> {
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(DocumentError::PageNotFound(page_id))?;
        let removed = tree::remove(&mut page.layers, layer_id)?;
        // Drop instance registrations for everything that went away.
        tree::walk(std::slice::from_ref(&removed), &mut |l, _| {
            page.component_instances.remove(&l.id);
        });
        Ok(())
    }

    /// Reparent/reorder a layer.
    pub fn move_layer(
        &mut self,
        page_id: Uuid,
        layer_id: Uuid,
        target_parent_id: Option<Uuid>,
        target_index: usize,
    ) -> Result<(), DocumentError> {
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(DocumentError::PageNotFound(page_id))?;
        tree::relocate(&mut page.layers, layer_id, target_parent_id, target_index)?;
        Ok(())
    }

    /// Read a layer from a page.
    pub fn layer(&self, page_id: Uuid, layer_id: Uuid) -> Option<&Layer> {
        tree::find(&self.pages.get(&page_id)?.layers, layer_id)
    }

    // ── Components ──────────────────────────────────────────────────

    pub fn insert_component(&mut self, component: Component) {
        self.components.insert(component.id, component);
    }

    pub fn component(&self, id: Uuid) -> Option<&Component> {
        self.components.get(&id)
    }

    pub fn remove_component(&mut self, id: Uuid) -> Option<Component> {
        self.components.remove(&id)
    }

    pub fn rename_component(&mut self, id: Uuid, name: String) -> Result<(), DocumentError> {
        let component = self
            .components
            .get_mut(&id)
            .ok_or(DocumentError::ComponentNotFound(id))?;
        component.name = name;
        Ok(())
    }

    /// Commit a component's canonical layers and propagate them into
    /// every page that embeds it as an instance. Creates the component
    /// if this client has never seen it (remote creation races a local
    /// save).
    pub fn apply_component_layers(&mut self, component_id: Uuid, layers: Vec<Layer>) {
        let component = self
            .components
            .entry(component_id)
            .or_insert_with(|| Component {
                id: component_id,
                name: String::new(),
                layers: Vec::new(),
            });
        component.layers = layers.clone();

        let mut refreshed = 0usize;
        for page in self.pages.values_mut() {
            for (&layer_id, &cid) in &page.component_instances {
                if cid != component_id {
                    continue;
                }
                if let Some(instance) = tree::find_mut(&mut page.layers, layer_id) {
                    instance.children = layers.clone();
                    refreshed += 1;
                }
            }
        }
        if refreshed > 0 {
            log::debug!(
                "component {component_id}: refreshed {refreshed} embedded instance(s)"
            );
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}
