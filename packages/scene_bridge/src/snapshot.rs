//! Scene snapshot store.
//!
//! A snapshot is the flattened, indexed projection of the visible part of the
//! layer tree. Building one is linear in the number of visible nodes; nothing
//! else is copied. Field access goes through [`LayerView`], a handle that
//! holds only an id and resolves every read against whatever snapshot the
//! store holds *at access time*.
//!
//! Rebuilds are keyed on the identity of the root `Rc`, never on deep
//! equality: a structurally identical but freshly allocated tree still
//! produces a new snapshot.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::layer::Layer;
use crate::property_override::OverrideRegistry;

/// Child-index path from the root to a node.
type LayerPath = Vec<usize>;

/// Immutable projection of one version of the layer tree.
#[derive(Debug)]
pub struct SceneSnapshot {
    tree: Rc<Layer>,
    /// Visible layers in pre-order, root excluded.
    flattened: Vec<LayerPath>,
    index: HashMap<String, LayerPath>,
}

impl SceneSnapshot {
    pub fn build(tree: Rc<Layer>) -> Self {
        let mut flattened = Vec::new();
        let mut index = HashMap::new();
        index.insert(tree.id.clone(), Vec::new());

        let mut path = Vec::new();
        flatten_into(&tree.children, &mut path, &mut flattened, &mut index);

        Self {
            tree,
            flattened,
            index,
        }
    }

    pub fn tree(&self) -> &Rc<Layer> {
        &self.tree
    }

    /// Concrete layer records in traversal order. For host-side iteration
    /// only; extensions go through views.
    pub fn flattened_raw(&self) -> impl Iterator<Item = &Layer> {
        self.flattened.iter().filter_map(|p| self.resolve_path(p))
    }

    pub fn flattened_ids(&self) -> Vec<&str> {
        self.flattened_raw().map(|l| l.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Layer> {
        self.index.get(id).and_then(|p| self.resolve_path(p))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.flattened.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flattened.is_empty()
    }

    fn resolve_path(&self, path: &[usize]) -> Option<&Layer> {
        let mut node = self.tree.as_ref();
        for &i in path {
            node = node.children.get(i)?;
        }
        Some(node)
    }
}

fn flatten_into(
    children: &[Layer],
    path: &mut LayerPath,
    flattened: &mut Vec<LayerPath>,
    index: &mut HashMap<String, LayerPath>,
) {
    for (i, layer) in children.iter().enumerate() {
        if !layer.visible {
            continue;
        }
        path.push(i);
        flattened.push(path.clone());
        index.insert(layer.id.clone(), path.clone());
        flatten_into(&layer.children, path, flattened, index);
        path.pop();
    }
}

struct StoreCell {
    current: RefCell<Rc<SceneSnapshot>>,
    overrides: RefCell<OverrideRegistry>,
    generation: Cell<u64>,
}

/// Shared handle to the current snapshot and the per-layer overrides.
#[derive(Clone)]
pub struct SnapshotStore {
    cell: Rc<StoreCell>,
}

impl SnapshotStore {
    pub fn new(tree: Rc<Layer>) -> Self {
        Self {
            cell: Rc::new(StoreCell {
                current: RefCell::new(Rc::new(SceneSnapshot::build(tree))),
                overrides: RefCell::new(OverrideRegistry::new()),
                generation: Cell::new(0),
            }),
        }
    }

    /// Rebuild if `tree` is a different allocation from the current one.
    /// Returns whether a rebuild happened.
    pub fn sync(&self, tree: &Rc<Layer>) -> bool {
        if Rc::ptr_eq(self.cell.current.borrow().tree(), tree) {
            return false;
        }
        let snapshot = SceneSnapshot::build(Rc::clone(tree));
        log::debug!(
            "Rebuilt scene snapshot: {} visible layers (generation {})",
            snapshot.len(),
            self.cell.generation.get() + 1
        );
        *self.cell.current.borrow_mut() = Rc::new(snapshot);
        self.cell.generation.set(self.cell.generation.get() + 1);
        true
    }

    pub fn snapshot(&self) -> Rc<SceneSnapshot> {
        Rc::clone(&self.cell.current.borrow())
    }

    /// Incremented on every rebuild.
    pub fn generation(&self) -> u64 {
        self.cell.generation.get()
    }

    pub fn find_by_id(&self, id: &str) -> Option<LayerView> {
        if !self.cell.current.borrow().contains(id) {
            return None;
        }
        LayerView::new(id, self.clone()).ok()
    }

    pub fn find_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Vec<Option<LayerView>> {
        ids.iter().map(|id| self.find_by_id(id.as_ref())).collect()
    }

    pub fn root(&self) -> BridgeResult<LayerView> {
        let id = self.cell.current.borrow().tree().id.clone();
        LayerView::new(id, self.clone())
    }

    /// Views over the flattened visible layers.
    pub fn layers(&self) -> Vec<LayerView> {
        let snapshot = self.snapshot();
        snapshot
            .flattened_raw()
            .filter_map(|l| LayerView::new(l.id.as_str(), self.clone()).ok())
            .collect()
    }

    pub fn override_property(&self, layer_id: &str, key: &str, patch: Option<Value>) -> bool {
        self.cell.overrides.borrow_mut().set(layer_id, key, patch)
    }

    pub fn clear_overrides(&self, key: &str) -> bool {
        self.cell.overrides.borrow_mut().clear_key(key)
    }

    pub fn overrides_version(&self) -> u64 {
        self.cell.overrides.borrow().version()
    }

    fn with_layer<R>(&self, id: &str, f: impl FnOnce(&Layer, &OverrideRegistry) -> R) -> Option<R> {
        let snapshot = self.cell.current.borrow();
        let layer = snapshot.get(id)?;
        let overrides = self.cell.overrides.borrow();
        Some(f(layer, &overrides))
    }
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("generation", &self.generation())
            .field("visible", &self.cell.current.borrow().len())
            .finish()
    }
}

/// Lightweight handle to a layer, keyed by id only.
///
/// Every accessor resolves against the store's current snapshot. When the id
/// is no longer reachable (removed, or under a hidden ancestor) accessors
/// return `None` rather than failing.
#[derive(Clone)]
pub struct LayerView {
    id: Rc<str>,
    store: SnapshotStore,
}

impl LayerView {
    pub fn new(id: impl AsRef<str>, store: SnapshotStore) -> BridgeResult<Self> {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(BridgeError::MissingLayerId);
        }
        Ok(Self {
            id: Rc::from(id),
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the id still resolves in the current snapshot.
    pub fn is_live(&self) -> bool {
        self.store.with_layer(&self.id, |_, _| ()).is_some()
    }

    pub fn title(&self) -> Option<String> {
        self.store.with_layer(&self.id, |l, _| l.title.clone()).flatten()
    }

    pub fn visible(&self) -> Option<bool> {
        self.store.with_layer(&self.id, |l, _| l.visible)
    }

    /// Base property merged with this layer's override patches.
    pub fn property(&self) -> Option<Value> {
        self.store
            .with_layer(&self.id, |l, overrides| overrides.resolve(&l.id, &l.property))
    }

    pub fn infobox(&self) -> Option<Value> {
        self.store.with_layer(&self.id, |l, _| l.infobox.clone()).flatten()
    }

    pub fn tags(&self) -> Option<Vec<String>> {
        self.store.with_layer(&self.id, |l, _| l.tags.clone())
    }

    pub fn extension_id(&self) -> Option<String> {
        self.store
            .with_layer(&self.id, |l, _| l.extension_id.clone())
            .flatten()
    }

    /// Views of the children that are reachable in the current snapshot.
    pub fn children(&self) -> Option<Vec<LayerView>> {
        let ids: Vec<String> = self
            .store
            .with_layer(&self.id, |l, _| l.children.iter().map(|c| c.id.clone()).collect())?;
        Some(
            ids.into_iter()
                .filter_map(|id| self.store.find_by_id(&id))
                .collect(),
        )
    }
}

impl PartialEq for LayerView {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.store.cell, &other.store.cell)
    }
}

impl fmt::Debug for LayerView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LayerView").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_tree() -> Rc<Layer> {
        let tree: Layer = serde_json::from_value(json!({
            "id": "root",
            "children": [
                { "id": "a", "visible": true, "children": [ { "id": "a1", "visible": true } ] },
                { "id": "b", "visible": false, "children": [ { "id": "b1" } ] }
            ]
        }))
        .unwrap();
        Rc::new(tree)
    }

    #[test]
    fn test_hidden_subtree_is_unreachable() {
        let store = SnapshotStore::new(scenario_tree());
        assert_eq!(store.snapshot().flattened_ids(), vec!["a", "a1"]);
        assert!(store.find_by_id("b1").is_none());
        assert!(store.find_by_id("b").is_none());
        assert!(store.find_by_id("a1").is_some());
    }

    #[test]
    fn test_preorder_with_siblings() {
        let tree = Layer::new("root").with_children(vec![
            Layer::new("a").with_children(vec![Layer::new("a1"), Layer::new("a2")]),
            Layer::new("b").with_children(vec![Layer::new("b1").hidden(), Layer::new("b2")]),
        ]);
        let store = SnapshotStore::new(Rc::new(tree));
        assert_eq!(store.snapshot().flattened_ids(), vec!["a", "a1", "a2", "b", "b2"]);
    }

    #[test]
    fn test_find_by_ids_is_positional() {
        let store = SnapshotStore::new(scenario_tree());
        let views = store.find_by_ids(&["a1", "b1", "a"]);
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].as_ref().map(|v| v.id()), Some("a1"));
        assert!(views[1].is_none());
        assert_eq!(views[2].as_ref().map(|v| v.id()), Some("a"));
    }

    #[test]
    fn test_root_view() {
        let store = SnapshotStore::new(scenario_tree());
        let root = store.root().unwrap();
        assert_eq!(root.id(), "root");
        let children: Vec<String> = root
            .children()
            .unwrap()
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(children, vec!["a"]);
    }

    #[test]
    fn test_rebuild_on_identity_not_equality() {
        let tree = scenario_tree();
        let store = SnapshotStore::new(Rc::clone(&tree));
        assert!(!store.sync(&tree));
        assert_eq!(store.generation(), 0);

        let copy = Rc::new(Layer::clone(&tree));
        assert!(store.sync(&copy));
        assert_eq!(store.generation(), 1);
        assert!(Rc::ptr_eq(store.snapshot().tree(), &copy));
        assert!(store.find_by_id("a1").is_some());
    }

    #[test]
    fn test_views_resolve_lazily() {
        let mut tree = Layer::clone(&scenario_tree());
        let store = SnapshotStore::new(Rc::new(tree.clone()));
        let view = store.find_by_id("a1").unwrap();
        assert_eq!(view.title(), None);

        let old = store.snapshot();
        if let Some(layer) = tree.find_mut("a1") {
            layer.title = Some("Renamed".into());
        }
        store.sync(&Rc::new(tree.clone()));
        assert_eq!(view.title().as_deref(), Some("Renamed"));
        // Previous snapshot is untouched.
        assert_eq!(old.get("a1").and_then(|l| l.title.clone()), None);

        // Hiding the parent makes the existing handle stale, not invalid.
        if let Some(layer) = tree.find_mut("a") {
            layer.visible = false;
        }
        store.sync(&Rc::new(tree));
        assert!(!view.is_live());
        assert_eq!(view.title(), None);
        assert_eq!(view.property(), None);
    }

    #[test]
    fn test_view_without_id_fails() {
        let store = SnapshotStore::new(scenario_tree());
        assert!(matches!(
            LayerView::new("", store),
            Err(BridgeError::MissingLayerId)
        ));
    }

    #[test]
    fn test_property_includes_overrides() {
        let mut tree = Layer::new("root");
        let mut a = Layer::new("a");
        a.property = json!({ "marker": { "size": 1, "color": "red" } });
        tree.children.push(a);
        let store = SnapshotStore::new(Rc::new(tree));

        assert!(store.override_property("a", "ext", Some(json!({ "marker": { "size": 4 } }))));
        let view = store.find_by_id("a").unwrap();
        assert_eq!(
            view.property(),
            Some(json!({ "marker": { "size": 4, "color": "red" } }))
        );
        assert_eq!(store.overrides_version(), 1);
    }
}
