//! Single tree-traversal utility for layer trees.
//!
//! Every operation that addresses a layer by id goes through these
//! helpers — there is exactly one walk implementation in the codebase.
//! The mutating entry points (`apply_patch`, `insert`, `remove`,
//! `relocate`) operate on a bare root list so both the client-side
//! `DocumentStore` and the relay's authoritative room trees share them.

use crate::layer::{Layer, LayerPatch};
use uuid::Uuid;

/// Errors from structural tree operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// No layer with this id anywhere in the tree.
    LayerNotFound(Uuid),
    /// The addressed parent does not exist.
    ParentNotFound(Uuid),
    /// A layer with this id is already present.
    DuplicateLayerId(Uuid),
    /// Moving a layer into its own subtree.
    MoveIntoSelf(Uuid),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::LayerNotFound(id) => write!(f, "layer not found: {id}"),
            TreeError::ParentNotFound(id) => write!(f, "parent layer not found: {id}"),
            TreeError::DuplicateLayerId(id) => write!(f, "duplicate layer id: {id}"),
            TreeError::MoveIntoSelf(id) => write!(f, "cannot move layer {id} into its own subtree"),
        }
    }
}

impl std::error::Error for TreeError {}

/// Visit every layer depth-first (explicit stack, no recursion limit).
///
/// The visitor receives each layer together with its depth from the
/// root list (roots are depth 0).
pub fn walk<'a>(roots: &'a [Layer], visit: &mut impl FnMut(&'a Layer, usize)) {
    let mut stack: Vec<(&Layer, usize)> = roots.iter().rev().map(|l| (l, 0)).collect();
    while let Some((layer, depth)) = stack.pop() {
        visit(layer, depth);
        for child in layer.children.iter().rev() {
            stack.push((child, depth + 1));
        }
    }
}

/// Find a layer by id.
pub fn find(roots: &[Layer], id: Uuid) -> Option<&Layer> {
    let mut stack: Vec<&Layer> = roots.iter().rev().collect();
    while let Some(layer) = stack.pop() {
        if layer.id == id {
            return Some(layer);
        }
        stack.extend(layer.children.iter().rev());
    }
    None
}

/// Find a layer by id, mutably.
pub fn find_mut(roots: &mut [Layer], id: Uuid) -> Option<&mut Layer> {
    for layer in roots {
        if layer.id == id {
            return Some(layer);
        }
        if let Some(found) = find_mut(&mut layer.children, id) {
            return Some(found);
        }
    }
    None
}

/// Whether any layer in the tree has this id.
pub fn contains(roots: &[Layer], id: Uuid) -> bool {
    find(roots, id).is_some()
}

/// Total layer count across all roots.
pub fn len(roots: &[Layer]) -> usize {
    roots.iter().map(Layer::subtree_len).sum()
}

/// Detach a layer (with its subtree) from wherever it sits.
pub fn detach(roots: &mut Vec<Layer>, id: Uuid) -> Option<Layer> {
    if let Some(pos) = roots.iter().position(|l| l.id == id) {
        return Some(roots.remove(pos));
    }
    for layer in roots.iter_mut() {
        if let Some(detached) = detach(&mut layer.children, id) {
            return Some(detached);
        }
    }
    None
}

/// Merge a shallow patch into the addressed layer.
pub fn apply_patch(roots: &mut [Layer], id: Uuid, patch: &LayerPatch) -> Result<(), TreeError> {
    let layer = find_mut(roots, id).ok_or(TreeError::LayerNotFound(id))?;
    patch.apply(layer);
    Ok(())
}

/// Insert a new layer under `parent` (or at the root when `None`).
///
/// Rejects the insert if any id in the incoming subtree already exists
/// in the tree — ids are the unit of addressing and must stay unique.
pub fn insert(
    roots: &mut Vec<Layer>,
    parent: Option<Uuid>,
    layer: Layer,
) -> Result<(), TreeError> {
    let mut duplicate = None;
    walk(std::slice::from_ref(&layer), &mut |l, _| {
        if duplicate.is_none() && contains(roots, l.id) {
            duplicate = Some(l.id);
        }
    });
    if let Some(id) = duplicate {
        return Err(TreeError::DuplicateLayerId(id));
    }

    match parent {
        Some(pid) => {
            let parent = find_mut(roots, pid).ok_or(TreeError::ParentNotFound(pid))?;
            parent.children.push(layer);
        }
        None => roots.push(layer),
    }
    Ok(())
}

/// Remove a layer (with its subtree).
pub fn remove(roots: &mut Vec<Layer>, id: Uuid) -> Result<Layer, TreeError> {
    detach(roots, id).ok_or(TreeError::LayerNotFound(id))
}

/// Move a layer under a new parent (or to the root) at `index`.
///
/// The index is clamped to the target sibling list. Moving a layer into
/// its own subtree is rejected before anything is detached, so a failed
/// move leaves the tree untouched.
pub fn relocate(
    roots: &mut Vec<Layer>,
    id: Uuid,
    target_parent: Option<Uuid>,
    index: usize,
) -> Result<(), TreeError> {
    let subject = find(roots, id).ok_or(TreeError::LayerNotFound(id))?;
    if let Some(pid) = target_parent {
        if pid == id || contains(&subject.children, pid) {
            return Err(TreeError::MoveIntoSelf(id));
        }
        if !contains(roots, pid) {
            return Err(TreeError::ParentNotFound(pid));
        }
    }

    let layer = detach(roots, id).ok_or(TreeError::LayerNotFound(id))?;
    let siblings = match target_parent {
        Some(pid) => match find_mut(roots, pid) {
            Some(parent) => &mut parent.children,
            // Checked above; the detach cannot have removed the target
            // parent because it is outside the moved subtree.
            None => {
                roots.push(layer);
                return Err(TreeError::ParentNotFound(pid));
            }
        },
        None => roots,
    };
    let index = index.min(siblings.len());
    siblings.insert(index, layer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (Vec<Layer>, Uuid, Uuid, Uuid) {
        let mut form = Layer::new("form");
        let mut row = Layer::new("div");
        let input = Layer::new("input");
        let (form_id, row_id, input_id) = (form.id, row.id, input.id);
        row.children.push(input);
        form.children.push(row);
        (vec![form], form_id, row_id, input_id)
    }

    #[test]
    fn test_find_nested() {
        let (roots, form_id, row_id, input_id) = sample_tree();
        assert_eq!(find(&roots, form_id).unwrap().name, "form");
        assert_eq!(find(&roots, row_id).unwrap().name, "div");
        assert_eq!(find(&roots, input_id).unwrap().name, "input");
        assert!(find(&roots, Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_walk_depth_first_order() {
        let (roots, ..) = sample_tree();
        let mut names = Vec::new();
        walk(&roots, &mut |layer, depth| names.push((layer.name.clone(), depth)));
        assert_eq!(
            names,
            vec![
                ("form".to_string(), 0),
                ("div".to_string(), 1),
                ("input".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_apply_patch_to_nested_layer() {
        let (mut roots, _, _, input_id) = sample_tree();
        let patch = LayerPatch::classes(vec!["w-full".to_string()]);
        apply_patch(&mut roots, input_id, &patch).unwrap();
        assert_eq!(find(&roots, input_id).unwrap().classes, vec!["w-full"]);
    }

    #[test]
    fn test_patch_missing_layer_errors() {
        let (mut roots, ..) = sample_tree();
        let id = Uuid::new_v4();
        let err = apply_patch(&mut roots, id, &LayerPatch::default()).unwrap_err();
        assert_eq!(err, TreeError::LayerNotFound(id));
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let (mut roots, _, _, input_id) = sample_tree();
        let dup = Layer::with_id(input_id, "div");
        let err = insert(&mut roots, None, dup).unwrap_err();
        assert_eq!(err, TreeError::DuplicateLayerId(input_id));
        assert_eq!(len(&roots), 3);
    }

    #[test]
    fn test_insert_rejects_duplicate_in_subtree() {
        let (mut roots, _, _, input_id) = sample_tree();
        let mut wrapper = Layer::new("div");
        wrapper.children.push(Layer::with_id(input_id, "input"));
        let err = insert(&mut roots, None, wrapper).unwrap_err();
        assert_eq!(err, TreeError::DuplicateLayerId(input_id));
    }

    #[test]
    fn test_remove_detaches_subtree() {
        let (mut roots, _, row_id, input_id) = sample_tree();
        let removed = remove(&mut roots, row_id).unwrap();
        assert_eq!(removed.subtree_len(), 2);
        assert!(!contains(&roots, input_id));
        assert_eq!(len(&roots), 1);
    }

    #[test]
    fn test_relocate_to_root() {
        let (mut roots, _, _, input_id) = sample_tree();
        relocate(&mut roots, input_id, None, 0).unwrap();
        assert_eq!(roots[0].id, input_id);
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_relocate_rejects_cycle() {
        let (mut roots, form_id, row_id, input_id) = sample_tree();
        let err = relocate(&mut roots, form_id, Some(input_id), 0).unwrap_err();
        assert_eq!(err, TreeError::MoveIntoSelf(form_id));
        // Tree untouched.
        assert_eq!(len(&roots), 3);
        assert!(contains(&find(&roots, form_id).unwrap().children, row_id));
    }

    #[test]
    fn test_relocate_clamps_index() {
        let (mut roots, form_id, _, input_id) = sample_tree();
        relocate(&mut roots, input_id, Some(form_id), 99).unwrap();
        let form = find(&roots, form_id).unwrap();
        assert_eq!(form.children.last().unwrap().id, input_id);
    }
}
