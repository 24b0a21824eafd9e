//! Layer model — the nodes of the visual document tree.
//!
//! A `Layer` is one element of a page or component (a div, image, form
//! input, …). Layers form a strict hierarchy: every layer is owned by
//! exactly one parent or by the tree root, and `id` is immutable and
//! unique across the whole document. The id is the unit of addressing
//! for updates, locks and broadcast targeting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// HTML-attribute value: builders only ever write strings or flags.
///
/// Externally tagged so the same derive serves both the JSON API and
/// the bincode wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Flag(bool),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Flag(b)
    }
}

/// Responsive breakpoint a design property applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Breakpoint {
    Base,
    Tablet,
    Mobile,
}

/// Interaction state a design property applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StyleState {
    Default,
    Hover,
    Focus,
    Active,
}

/// Structured per-breakpoint / per-state style properties.
///
/// Leaf maps are plain CSS-ish `property → value` pairs; the class-name
/// generation that turns these into utility classes lives outside this
/// crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignProps {
    pub props: BTreeMap<Breakpoint, BTreeMap<StyleState, BTreeMap<String, String>>>,
}

impl DesignProps {
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Set a single property for a breakpoint/state pair.
    pub fn set(
        &mut self,
        breakpoint: Breakpoint,
        state: StyleState,
        property: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.props
            .entry(breakpoint)
            .or_default()
            .entry(state)
            .or_default()
            .insert(property.into(), value.into());
    }

    /// Look up a single property for a breakpoint/state pair.
    pub fn get(&self, breakpoint: Breakpoint, state: StyleState, property: &str) -> Option<&str> {
        self.props
            .get(&breakpoint)?
            .get(&state)?
            .get(property)
            .map(String::as_str)
    }
}

/// Link behavior attached to a layer or text binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    pub href: String,
    pub open_in_new_tab: bool,
}

/// Typed data binding attached to a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Literal text content.
    StaticText(String),
    /// Expression evaluated against page data at render time.
    DynamicText { expression: String },
    /// Reference to an uploaded asset.
    Asset { asset_id: Uuid },
    /// Reference to a CMS collection field.
    CmsField { collection_id: Uuid, field: String },
    /// Link settings.
    Link(LinkSettings),
}

/// A node in the visual document's element tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Stable, globally unique id within a document. Never reassigned.
    pub id: Uuid,
    /// Node kind, e.g. "div", "input", "form", "video".
    pub name: String,
    /// HTML-attribute map.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    /// Ordered style-class tokens.
    #[serde(default)]
    pub classes: Vec<String>,
    /// Per-breakpoint / per-state design properties.
    #[serde(default)]
    pub design: DesignProps,
    /// Typed data bindings keyed by slot name.
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    /// Child layers, ordered.
    #[serde(default)]
    pub children: Vec<Layer>,
    /// Reference to a shared named style, if any.
    #[serde(default)]
    pub style_id: Option<Uuid>,
    /// Local overrides on top of the shared style.
    #[serde(default)]
    pub style_overrides: BTreeMap<String, String>,
}

impl Layer {
    /// Create a layer with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create a layer with an explicit id (remote adds, tests).
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            attributes: BTreeMap::new(),
            classes: Vec::new(),
            design: DesignProps::default(),
            variables: BTreeMap::new(),
            children: Vec::new(),
            style_id: None,
            style_overrides: BTreeMap::new(),
        }
    }

    /// Number of layers in this subtree, including self.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Layer::subtree_len).sum::<usize>()
    }
}

/// Shallow partial of a [`Layer`], merged key-wise.
///
/// Present fields overwrite the layer's current value wholesale —
/// last-write-wins per key, never a diff. Applying the same patch twice
/// yields the same layer as applying it once. A patch can never change
/// `id` or `children`; structure moves through add/delete/move
/// operations instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerPatch {
    pub name: Option<String>,
    pub attributes: Option<BTreeMap<String, AttrValue>>,
    pub classes: Option<Vec<String>>,
    pub design: Option<DesignProps>,
    pub variables: Option<BTreeMap<String, Variable>>,
    /// `Some(None)` clears the style reference; `None` leaves it alone.
    pub style_id: Option<Option<Uuid>>,
    pub style_overrides: Option<BTreeMap<String, String>>,
}

impl LayerPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.attributes.is_none()
            && self.classes.is_none()
            && self.design.is_none()
            && self.variables.is_none()
            && self.style_id.is_none()
            && self.style_overrides.is_none()
    }

    /// Whether this patch edits text content (drives the presence UI's
    /// "typing" indicator, nothing else).
    pub fn is_text_edit(&self) -> bool {
        self.variables.is_some()
    }

    /// Merge this patch into `layer`, field-overwrite semantics.
    pub fn apply(&self, layer: &mut Layer) {
        if let Some(name) = &self.name {
            layer.name = name.clone();
        }
        if let Some(attributes) = &self.attributes {
            layer.attributes = attributes.clone();
        }
        if let Some(classes) = &self.classes {
            layer.classes = classes.clone();
        }
        if let Some(design) = &self.design {
            layer.design = design.clone();
        }
        if let Some(variables) = &self.variables {
            layer.variables = variables.clone();
        }
        if let Some(style_id) = &self.style_id {
            layer.style_id = *style_id;
        }
        if let Some(style_overrides) = &self.style_overrides {
            layer.style_overrides = style_overrides.clone();
        }
    }

    /// Patch that only replaces the class list.
    pub fn classes(classes: Vec<String>) -> Self {
        Self {
            classes: Some(classes),
            ..Self::default()
        }
    }

    /// Patch that only replaces the attribute map.
    pub fn attributes(attributes: BTreeMap<String, AttrValue>) -> Self {
        Self {
            attributes: Some(attributes),
            ..Self::default()
        }
    }
}
