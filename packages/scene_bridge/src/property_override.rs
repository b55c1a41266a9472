//! Layered property overrides.
//!
//! Each writer (an extension instance, or the shared common key `""`) owns one
//! partial patch. The effective property is the base value deep-merged with
//! the common patch first and then every other patch in insertion order, so
//! later writers win on overlapping leaves. No conflict detection is done:
//! two writers targeting the same leaf is the callers' problem.
//!
//! Merge rules:
//! - objects merge key by key, recursively
//! - arrays and scalars in a patch replace the base value wholesale
//! - `null` in a patch is the marshaled form of "undefined" and keeps the base
//!   leaf (it never deletes)

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::{Map, Value};

/// Override key shared by host-side edits; always merged before any extension.
pub const COMMON_KEY: &str = "";

/// Deep-merge `patch` onto `base` without touching either.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (_, Value::Null) => base.clone(),
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut out = base_map.clone();
            for (key, value) in patch_map {
                if value.is_null() {
                    continue;
                }
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => materialize(value),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => materialize(patch),
    }
}

/// Drop `null` leaves from nested objects so a patch can stand on its own.
fn materialize(patch: &Value) -> Value {
    match patch {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), materialize(v)))
                .collect();
            Value::Object(cleaned)
        }
        other => other.clone(),
    }
}

/// Ordered set of keyed patches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSet {
    entries: Vec<(String, Value)>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replace or (with `None` / `null`) delete the patch for `key`.
    ///
    /// Replacing keeps the key's position; deleting then re-adding moves it to
    /// the end. Returns false when nothing observable changed.
    pub fn set(&mut self, key: &str, patch: Option<Value>) -> bool {
        let patch = patch.filter(|p| !p.is_null());
        let pos = self.entries.iter().position(|(k, _)| k == key);
        match (pos, patch) {
            (Some(i), None) => {
                self.entries.remove(i);
                true
            }
            (None, None) => false,
            (Some(i), Some(p)) => {
                if self.entries[i].1 == p {
                    return false;
                }
                self.entries[i].1 = p;
                true
            }
            (None, Some(p)) => {
                self.entries.push((key.to_string(), p));
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Keys in merge order: the common key first, then insertion order.
    pub fn merge_order(&self) -> impl Iterator<Item = &(String, Value)> {
        let common = self.entries.iter().filter(|(k, _)| k == COMMON_KEY);
        let rest = self.entries.iter().filter(|(k, _)| k != COMMON_KEY);
        common.chain(rest)
    }

    pub fn apply(&self, base: &Value) -> Value {
        self.merge_order()
            .fold(base.clone(), |acc, (_, patch)| deep_merge(&acc, patch))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A base value plus its override patches, with a memoized effective value.
#[derive(Debug)]
pub struct PropertyOverrideStack {
    base: Value,
    patches: PatchSet,
    version: u64,
    cached: RefCell<Option<Value>>,
}

impl PropertyOverrideStack {
    pub fn new(base: Value) -> Self {
        Self {
            base,
            patches: PatchSet::new(),
            version: 0,
            cached: RefCell::new(None),
        }
    }

    /// Effective value. The base is never mutated.
    pub fn get(&self) -> Value {
        if let Some(v) = self.cached.borrow().as_ref() {
            return v.clone();
        }
        let merged = self.patches.apply(&self.base);
        *self.cached.borrow_mut() = Some(merged.clone());
        merged
    }

    pub fn set(&mut self, key: &str, patch: Option<Value>) -> bool {
        let changed = self.patches.set(key, patch);
        if changed {
            self.invalidate();
        }
        changed
    }

    pub fn set_base(&mut self, base: Value) -> bool {
        if self.base == base {
            return false;
        }
        self.base = base;
        self.invalidate();
        true
    }

    pub fn base(&self) -> &Value {
        &self.base
    }

    /// Bumped on every observable change; stays put for no-op writes.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn invalidate(&mut self) {
        self.version += 1;
        *self.cached.get_mut() = None;
    }
}

/// Per-layer patch sets written through `overrideProperty`.
#[derive(Debug, Default)]
pub struct OverrideRegistry {
    layers: HashMap<String, PatchSet>,
    version: u64,
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, layer_id: &str, key: &str, patch: Option<Value>) -> bool {
        let changed = match self.layers.get_mut(layer_id) {
            Some(set) => set.set(key, patch),
            None => {
                let mut set = PatchSet::new();
                let changed = set.set(key, patch);
                if changed {
                    self.layers.insert(layer_id.to_string(), set);
                }
                changed
            }
        };
        if changed {
            self.layers.retain(|_, set| !set.is_empty());
            self.version += 1;
        }
        changed
    }

    /// Remove every patch written under `key`, across all layers.
    pub fn clear_key(&mut self, key: &str) -> bool {
        let mut changed = false;
        for set in self.layers.values_mut() {
            changed |= set.set(key, None);
        }
        if changed {
            self.layers.retain(|_, set| !set.is_empty());
            self.version += 1;
        }
        changed
    }

    pub fn resolve(&self, layer_id: &str, base: &Value) -> Value {
        match self.layers.get(layer_id) {
            Some(set) => set.apply(base),
            None => base.clone(),
        }
    }

    pub fn patches(&self, layer_id: &str) -> Option<&PatchSet> {
        self.layers.get(layer_id)
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_objects_merge_recursively() {
        let base = json!({ "a": { "b": 1, "c": 2 }, "d": "x" });
        let merged = deep_merge(&base, &json!({ "a": { "c": 3 } }));
        assert_eq!(merged, json!({ "a": { "b": 1, "c": 3 }, "d": "x" }));
    }

    #[test]
    fn test_null_keeps_base_leaf() {
        let base = json!({ "a": { "b": 1, "c": 2 } });
        let merged = deep_merge(&base, &json!({ "a": { "b": null } }));
        assert_eq!(merged, json!({ "a": { "b": 1, "c": 2 } }));
    }

    #[test]
    fn test_arrays_replace() {
        let base = json!({ "points": [1, 2, 3], "style": { "color": "red" } });
        let merged = deep_merge(&base, &json!({ "points": [9] }));
        assert_eq!(merged["points"], json!([9]));
        assert_eq!(merged["style"]["color"], "red");
    }

    #[test]
    fn test_scalar_patch_replaces_object() {
        let merged = deep_merge(&json!({ "a": { "b": 1 } }), &json!({ "a": 5 }));
        assert_eq!(merged, json!({ "a": 5 }));
    }

    #[test]
    fn test_new_subtree_drops_null_leaves() {
        let merged = deep_merge(&json!({}), &json!({ "a": { "b": null, "c": 1 } }));
        assert_eq!(merged, json!({ "a": { "c": 1 } }));
    }

    #[test]
    fn test_common_key_merges_first() {
        let mut stack = PropertyOverrideStack::new(json!({ "size": 1 }));
        stack.set("ext-a", Some(json!({ "size": 2 })));
        stack.set(COMMON_KEY, Some(json!({ "size": 3, "color": "blue" })));
        assert_eq!(stack.get(), json!({ "size": 2, "color": "blue" }));
    }

    #[test]
    fn test_later_writer_wins() {
        let mut stack = PropertyOverrideStack::new(json!({}));
        stack.set("a", Some(json!({ "v": "a" })));
        stack.set("b", Some(json!({ "v": "b" })));
        assert_eq!(stack.get()["v"], "b");

        // Replacing keeps position, so b still wins.
        stack.set("a", Some(json!({ "v": "a2" })));
        assert_eq!(stack.get()["v"], "b");

        // Delete then re-add moves a to the end.
        stack.set("a", None);
        stack.set("a", Some(json!({ "v": "a3" })));
        assert_eq!(stack.get()["v"], "a3");
    }

    #[test]
    fn test_same_value_is_noop() {
        let mut stack = PropertyOverrideStack::new(json!({ "x": 1 }));
        assert!(stack.set("a", Some(json!({ "x": 2 }))));
        let version = stack.version();
        assert!(!stack.set("a", Some(json!({ "x": 2 }))));
        assert_eq!(stack.version(), version);
        assert!(!stack.set("missing", None));
    }

    #[test]
    fn test_delete_removes_key_entirely() {
        let mut stack = PropertyOverrideStack::new(json!({ "x": 1 }));
        stack.set("a", Some(json!({ "x": 2 })));
        assert!(stack.set("a", Some(Value::Null)));
        assert_eq!(stack.get(), json!({ "x": 1 }));
        assert!(stack.patches.is_empty());
    }

    #[test]
    fn test_base_not_mutated() {
        let mut stack = PropertyOverrideStack::new(json!({ "a": { "b": 1 } }));
        stack.set("k", Some(json!({ "a": { "b": 2 } })));
        let _ = stack.get();
        assert_eq!(stack.base(), &json!({ "a": { "b": 1 } }));
    }

    #[test]
    fn test_registry_clear_key() {
        let mut registry = OverrideRegistry::new();
        registry.set("layer1", "ext", Some(json!({ "x": 1 })));
        registry.set("layer2", "ext", Some(json!({ "y": 1 })));
        registry.set("layer2", "other", Some(json!({ "z": 1 })));
        assert!(registry.clear_key("ext"));
        assert!(registry.patches("layer1").is_none());
        assert_eq!(registry.resolve("layer2", &json!({})), json!({ "z": 1 }));
        assert!(!registry.clear_key("ext"));
    }
}
