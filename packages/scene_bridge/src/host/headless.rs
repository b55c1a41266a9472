//! In-memory host used by the CLI and the tests.
//!
//! `HeadlessEngine` applies camera commands immediately and records every call
//! it receives. `TreeHost` keeps the layer tree copy-on-write so each edit
//! yields a new root allocation.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::camera::{CameraDestination, CameraRecord, FlightOptions};
use crate::events::MouseEvent;
use crate::layer::Layer;

use super::{LayerHost, RenderingEngine, Selection};

/// A call the engine received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    FlyTo(CameraDestination, FlightOptions),
    LookAt(CameraDestination, FlightOptions),
    ZoomIn(f64),
    ZoomOut(f64),
}

#[derive(Debug)]
pub struct HeadlessEngine {
    name: String,
    camera: Option<CameraRecord>,
    calls: Vec<EngineCall>,
    mouse_events: VecDeque<MouseEvent>,
}

impl HeadlessEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            camera: Some(CameraRecord::default()),
            calls: Vec::new(),
            mouse_events: VecDeque::new(),
        }
    }

    /// Move the camera as if the user dragged it.
    pub fn set_camera(&mut self, camera: Option<CameraRecord>) {
        self.camera = camera;
    }

    /// Queue a pointer event as if it came from the canvas.
    pub fn push_mouse_event(&mut self, event: MouseEvent) {
        self.mouse_events.push_back(event);
    }

    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }
}

impl RenderingEngine for HeadlessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn fly_to(&mut self, destination: &CameraDestination, options: &FlightOptions) {
        self.calls
            .push(EngineCall::FlyTo(destination.clone(), options.clone()));
        let current = self.camera.unwrap_or_default();
        self.camera = Some(destination.apply_to(&current));
    }

    fn look_at(&mut self, destination: &CameraDestination, options: &FlightOptions) {
        self.calls
            .push(EngineCall::LookAt(destination.clone(), options.clone()));
        let current = self.camera.unwrap_or_default();
        let mut oriented = current.looking_at(
            destination.lat.unwrap_or(current.lat),
            destination.lng.unwrap_or(current.lng),
            destination.height.unwrap_or(0.0),
        );
        if let Some(heading) = destination.heading {
            oriented.heading = heading;
        }
        if let Some(pitch) = destination.pitch {
            oriented.pitch = pitch;
        }
        self.camera = Some(oriented);
    }

    fn zoom_in(&mut self, amount: f64) {
        self.calls.push(EngineCall::ZoomIn(amount));
        if let Some(camera) = self.camera.as_mut() {
            camera.height /= 1.0 + amount.max(0.0);
        }
    }

    fn zoom_out(&mut self, amount: f64) {
        self.calls.push(EngineCall::ZoomOut(amount));
        if let Some(camera) = self.camera.as_mut() {
            camera.height *= 1.0 + amount.max(0.0);
        }
    }

    fn camera(&self) -> Option<CameraRecord> {
        self.camera
    }

    fn drain_mouse_events(&mut self) -> Vec<MouseEvent> {
        self.mouse_events.drain(..).collect()
    }
}

/// Layer tree and selection held in memory.
#[derive(Debug)]
pub struct TreeHost {
    root: Rc<Layer>,
    selection: Selection,
    next_id: u64,
}

impl TreeHost {
    pub fn new(root: Layer) -> Self {
        Self {
            root: Rc::new(root),
            selection: Selection::default(),
            next_id: 1,
        }
    }

    /// Swap in a whole new tree.
    pub fn replace(&mut self, root: Layer) {
        self.root = Rc::new(root);
    }

    /// Apply `edit` to a copy of the tree; the copy becomes the new root only
    /// if the edit reports a change.
    fn edit(&mut self, edit: impl FnOnce(&mut Layer) -> bool) -> bool {
        let mut next = Layer::clone(&self.root);
        if !edit(&mut next) {
            return false;
        }
        self.root = Rc::new(next);
        true
    }

    fn set_visible(&mut self, ids: &[String], visible: bool) {
        self.edit(|root| {
            let mut changed = false;
            for id in ids {
                if let Some(layer) = root.find_mut(id) {
                    changed |= layer.visible != visible;
                    layer.visible = visible;
                }
            }
            changed
        });
    }

    fn generate_id(&mut self) -> String {
        loop {
            let id = format!("layer-{}", self.next_id);
            self.next_id += 1;
            if self.root.find(&id).is_none() {
                return id;
            }
        }
    }
}

impl LayerHost for TreeHost {
    fn tree(&self) -> Rc<Layer> {
        Rc::clone(&self.root)
    }

    fn selection(&self) -> Selection {
        self.selection.clone()
    }

    fn select(&mut self, layer_id: Option<&str>, reason: Option<&str>) {
        let overridden_infobox = layer_id
            .and_then(|id| self.root.find(id))
            .and_then(|l| l.infobox.clone());
        self.selection = Selection {
            layer_id: layer_id.map(str::to_string),
            reason: reason.map(str::to_string),
            overridden_infobox,
        };
    }

    fn show(&mut self, ids: &[String]) {
        self.set_visible(ids, true);
    }

    fn hide(&mut self, ids: &[String]) {
        self.set_visible(ids, false);
    }

    fn add_layer(
        &mut self,
        mut layer: Layer,
        parent_id: Option<&str>,
        creator: Option<&str>,
    ) -> Option<String> {
        if layer.id.is_empty() {
            layer.id = self.generate_id();
        }
        if self.root.find(&layer.id).is_some() {
            log::warn!("add_layer: id `{}` already exists", layer.id);
            return None;
        }
        if layer.creator.is_none() {
            layer.creator = creator.map(str::to_string);
        }
        let id = layer.id.clone();
        let parent = parent_id.unwrap_or(self.root.id.as_str()).to_string();
        let added = self.edit(|root| match root.find_mut(&parent) {
            Some(node) => {
                node.children.push(layer);
                true
            }
            None => false,
        });
        if !added {
            log::warn!("add_layer: unknown parent `{}`", parent);
            return None;
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> TreeHost {
        TreeHost::new(Layer::new("root").with_children(vec![Layer::new("a"), Layer::new("b")]))
    }

    #[test]
    fn test_edits_replace_root() {
        let mut host = host();
        let before = host.tree();
        host.hide(&["a".to_string()]);
        let after = host.tree();
        assert!(!Rc::ptr_eq(&before, &after));
        assert_eq!(after.find("a").map(|l| l.visible), Some(false));
    }

    #[test]
    fn test_noop_edit_keeps_root() {
        let mut host = host();
        let before = host.tree();
        host.show(&["a".to_string(), "missing".to_string()]);
        assert!(Rc::ptr_eq(&before, &host.tree()));
    }

    #[test]
    fn test_add_layer() {
        let mut host = host();
        let id = host.add_layer(Layer::new(""), Some("a"), Some("ext"));
        let id = id.expect("layer added");
        let added = host.tree().find(&id).cloned().unwrap();
        assert_eq!(added.creator.as_deref(), Some("ext"));
        assert!(host.add_layer(Layer::new("b"), None, None).is_none());
        assert!(host.add_layer(Layer::new("c"), Some("nope"), None).is_none());
    }

    #[test]
    fn test_zoom_and_fly() {
        let mut engine = HeadlessEngine::new("headless");
        engine.set_camera(Some(CameraRecord {
            height: 1000.0,
            ..Default::default()
        }));
        engine.zoom_in(1.0);
        assert_eq!(engine.camera().map(|c| c.height), Some(500.0));
        engine.zoom_out(3.0);
        assert_eq!(engine.camera().map(|c| c.height), Some(2000.0));
        engine.fly_to(
            &CameraDestination {
                lat: Some(10.0),
                ..Default::default()
            },
            &FlightOptions::default(),
        );
        assert_eq!(engine.camera().map(|c| c.lat), Some(10.0));
        assert_eq!(engine.calls().len(), 3);
    }
}
