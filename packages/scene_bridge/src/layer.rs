//! Layer tree owned by the host.
//!
//! Layers are plain data. The host replaces the root `Rc` whenever the tree is
//! edited, which is what the snapshot store keys its rebuilds on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_visible() -> bool {
    true
}

/// A node of the scene's layer tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: String,

    #[serde(default)]
    pub title: Option<String>,

    /// Hidden layers take their whole subtree out of the snapshot.
    #[serde(default = "default_visible")]
    pub visible: bool,

    /// Arbitrary property bag, overridable per extension.
    #[serde(default)]
    pub property: Value,

    /// Linked info panel content.
    #[serde(default)]
    pub infobox: Option<Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Primitive extension that draws this layer, if any.
    #[serde(default)]
    pub extension_id: Option<String>,

    /// Extension that added this layer at runtime.
    #[serde(default)]
    pub creator: Option<String>,

    #[serde(default)]
    pub children: Vec<Layer>,
}

impl Layer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            visible: true,
            property: Value::Null,
            infobox: None,
            tags: Vec::new(),
            extension_id: None,
            creator: None,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Layer>) -> Self {
        self.children = children;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Depth-first search over the whole tree, hidden subtrees included.
    pub fn find(&self, id: &str) -> Option<&Layer> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Layer> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    /// Count of nodes in the subtree rooted here.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(Layer::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check id uniqueness across the tree; returns the first duplicate found.
    pub fn first_duplicate_id(&self) -> Option<String> {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![self];
        while let Some(layer) = stack.pop() {
            if !seen.insert(layer.id.as_str()) {
                return Some(layer.id.clone());
            }
            stack.extend(layer.children.iter().rev());
        }
        None
    }
}

/// A tag that layers can reference by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_visible_defaults_to_true() {
        let layer: Layer = serde_json::from_value(json!({ "id": "a" })).unwrap();
        assert!(layer.visible);
        assert!(layer.children.is_empty());
    }

    #[test]
    fn test_find_reaches_hidden_subtrees() {
        let root = Layer::new("root").with_children(vec![
            Layer::new("b").hidden().with_children(vec![Layer::new("b1")]),
        ]);
        assert!(root.find("b1").is_some());
        assert_eq!(root.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_detected() {
        let root = Layer::new("root").with_children(vec![Layer::new("a"), Layer::new("a")]);
        assert_eq!(root.first_duplicate_id().as_deref(), Some("a"));
    }
}
