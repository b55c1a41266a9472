//! The editor shell: owns the host collaborators and every mounted instance.
//!
//! A pump refreshes the watched inputs, recomposes the common slice, lets
//! each instance observe it (in mount order), forwards pointer events, then
//! drains every instance's command port and applies the commands to the host
//! exactly once. Messages produced while applying are delivered through the
//! registry, which may queue more commands; the loop repeats until nothing is
//! queued or `max_pump_rounds` is reached.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value;

use crate::capability::{
    Command, CommandPort, CommonComposer, CommonSlice, ExtensionKind, Placement, SurfaceComposer,
};
use crate::config::BridgeConfig;
use crate::diagnostics::{DiagnosticLog, DiagnosticPhase, ExtensionDiagnostic};
use crate::error::{BridgeError, BridgeResult};
use crate::events::BridgeEvent;
use crate::host::{ClockState, HostInputs, LayerHost, RenderingEngine, Viewport};
use crate::layer::Tag;
use crate::property_override::{PropertyOverrideStack, COMMON_KEY};
use crate::registry::{InstanceRegistry, RouteOutcome, RoutedMessage, SendFn};
use crate::sandbox::ExtensionSandbox;
use crate::snapshot::SnapshotStore;
use crate::surface_rhai::SurfaceLink;
use crate::sync::InstanceSync;

/// Observer of each newly composed common slice.
pub type InspectHook = Box<dyn FnMut(&CommonSlice)>;

/// Configuration plus the optional debug inspection hook.
pub struct BridgeContext {
    pub config: BridgeConfig,
    inspect: Option<InspectHook>,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            inspect: None,
        }
    }

    /// Install `hook`. It only runs when `debug_inspect` is enabled.
    pub fn with_inspect(mut self, hook: InspectHook) -> Self {
        self.inspect = Some(hook);
        self
    }

    fn inspect(&mut self, common: &CommonSlice) {
        if !self.config.debug_inspect {
            return;
        }
        if let Some(hook) = self.inspect.as_mut() {
            hook(common);
        }
    }
}

/// What to mount.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub instance_id: String,
    pub extension_id: String,
    pub placement: Placement,
    pub source: String,
}

/// A command applied to the host, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCommand {
    pub instance_id: String,
    pub command: Command,
}

struct MountedInstance {
    extension_id: String,
    placement: Rc<RefCell<Placement>>,
    sandbox: Rc<RefCell<ExtensionSandbox>>,
    surfaces: SurfaceComposer,
    sync: InstanceSync,
    source: String,
}

impl MountedInstance {
    fn commands(&self) -> &Rc<CommandPort> {
        self.surfaces.commands()
    }
}

pub struct EditorShell<E: RenderingEngine, H: LayerHost> {
    ctx: BridgeContext,
    engine: E,
    host: H,
    store: SnapshotStore,
    inputs: HostInputs,
    scene_property: PropertyOverrideStack,
    composer: CommonComposer,
    registry: InstanceRegistry,
    instances: HashMap<String, MountedInstance>,
    last_common: Option<Rc<CommonSlice>>,
    applied: Vec<AppliedCommand>,
    diagnostics: DiagnosticLog,
}

impl<E: RenderingEngine, H: LayerHost> EditorShell<E, H> {
    pub fn new(ctx: BridgeContext, engine: E, host: H) -> Self {
        let store = SnapshotStore::new(host.tree());
        let composer = CommonComposer::new(
            ctx.config.version.clone(),
            ctx.config.api_version,
            engine.name().to_string(),
        );
        let diagnostics = DiagnosticLog::new(ctx.config.max_diagnostics);
        let mut shell = Self {
            ctx,
            engine,
            host,
            store,
            inputs: HostInputs::default(),
            scene_property: PropertyOverrideStack::new(Value::Null),
            composer,
            registry: InstanceRegistry::new(),
            instances: HashMap::new(),
            last_common: None,
            applied: Vec::new(),
            diagnostics,
        };
        shell.refresh_inputs();
        shell
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    /// Bridge-level diagnostics: message routing failures.
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Diagnostics recorded by one instance's sandbox.
    pub fn instance_diagnostics(&self, id: &str) -> Vec<ExtensionDiagnostic> {
        self.instances
            .get(id)
            .map(|inst| inst.sandbox.borrow().diagnostics().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instance_logs(&self, id: &str) -> Vec<crate::extension_log::LogLine> {
        self.instances
            .get(id)
            .map(|inst| inst.sandbox.borrow().logger().history())
            .unwrap_or_default()
    }

    pub fn instance_source(&self, id: &str) -> Option<&str> {
        self.instances.get(id).map(|inst| inst.source.as_str())
    }

    pub fn instance_extension(&self, id: &str) -> Option<&str> {
        self.instances.get(id).map(|inst| inst.extension_id.as_str())
    }

    /// Commands applied since the last call.
    pub fn take_applied(&mut self) -> Vec<AppliedCommand> {
        std::mem::take(&mut self.applied)
    }

    fn refresh_inputs(&mut self) {
        self.store.sync(&self.host.tree());
        self.inputs.camera.set(self.engine.camera());
        self.inputs.selection.set(self.host.selection());
    }

    fn compose(&mut self) -> Rc<CommonSlice> {
        self.refresh_inputs();
        let common = self.composer.compose(&self.inputs, &self.store);
        let changed = self
            .last_common
            .as_ref()
            .map_or(true, |last| !Rc::ptr_eq(last, &common));
        if changed {
            self.ctx.inspect(&common);
            self.last_common = Some(Rc::clone(&common));
        }
        common
    }

    /// Mount and start an instance. A script that fails to load stays
    /// mounted (so it can be reloaded) but receives nothing; the load error is
    /// returned.
    pub fn mount(&mut self, request: MountRequest) -> BridgeResult<()> {
        let MountRequest {
            instance_id,
            extension_id,
            placement,
            source,
        } = request;
        let kind = placement.kind();
        self.registry.register(&instance_id, &extension_id, kind)?;

        let placement = Rc::new(RefCell::new(placement));
        let port = Rc::new(CommandPort::new(instance_id.clone()));
        let surfaces = SurfaceComposer::new(kind, Placement::thunks(&placement, &self.store), port);
        let link = Rc::new(SurfaceLink::new(instance_id.clone()));
        let sandbox = Rc::new(RefCell::new(ExtensionSandbox::new(
            &extension_id,
            kind,
            Rc::clone(&link),
            &self.ctx.config,
        )));

        let mut instance = MountedInstance {
            extension_id,
            placement,
            sandbox,
            surfaces,
            sync: InstanceSync::new(),
            source,
        };
        let result = self.start(&instance_id, &mut instance);
        self.instances.insert(instance_id.clone(), instance);
        log::info!("Mounted {instance_id} ({kind})");
        self.pump();
        result
    }

    /// Run the instance's source against the current surface and begin
    /// observing.
    fn start(&mut self, id: &str, instance: &mut MountedInstance) -> BridgeResult<()> {
        let common = self.compose();
        let surface = instance.surfaces.surface_for(&common);
        let loaded = {
            let mut sandbox = instance.sandbox.borrow_mut();
            sandbox.link().set(surface);
            sandbox.load(&instance.source)
        };
        self.registry.increment(id);
        instance.sync = InstanceSync::new();
        if loaded.is_ok() {
            instance.sync.activate(&common);
            self.registry.bind_sender(id, sender_for(&instance.sandbox))?;
        }
        loaded
    }

    /// Re-run an instance's code, optionally with new source. Handlers from
    /// the previous run get `close` first. The run counter increments.
    pub fn reload(&mut self, id: &str, source: Option<String>) -> BridgeResult<()> {
        let mut instance = self
            .instances
            .remove(id)
            .ok_or_else(|| BridgeError::UnknownInstance(id.to_string()))?;
        if instance.sync.teardown().is_some() {
            instance.sandbox.borrow_mut().dispatch(&BridgeEvent::Close).ok();
        }
        self.registry.unbind_sender(id);
        if let Some(source) = source {
            instance.source = source;
        }
        let result = self.start(id, &mut instance);
        self.instances.insert(id.to_string(), instance);
        log::info!("Reloaded {id} (run {})", self.registry.run_count(id).unwrap_or(0));
        self.pump();
        result
    }

    /// Tear an instance down: `close` is delivered and whatever its handler
    /// queued is applied once, then delivery stops and its property
    /// overrides are cleared. Messages already queued for it are dropped
    /// when they come up for delivery.
    pub fn unmount(&mut self, id: &str) -> BridgeResult<()> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownInstance(id.to_string()))?;
        if instance.sync.teardown().is_some() {
            instance.sandbox.borrow_mut().close();
        }
        let pending = instance.commands().drain();
        self.registry.unbind_sender(id);
        for command in pending {
            if matches!(&command, Command::PostMessage { target, .. } if target == id) {
                log::debug!("[{id}] dropping message to itself on close");
                continue;
            }
            self.apply(id, command);
        }
        self.instances.remove(id);
        self.registry.unregister(id);
        self.store.clear_overrides(id);
        log::info!("Unmounted {id}");
        Ok(())
    }

    pub fn reset_run_count(&mut self, id: Option<&str>) {
        match id {
            Some(id) => {
                self.registry.clear(id);
            }
            None => self.registry.clear_all(),
        }
    }

    pub fn run_count(&self, id: &str) -> Option<u32> {
        self.registry.run_count(id)
    }

    /// Change where an instance is placed. Visible on its next read.
    pub fn set_placement(&mut self, id: &str, placement: Placement) -> BridgeResult<()> {
        let instance = self
            .instances
            .get(id)
            .ok_or_else(|| BridgeError::UnknownInstance(id.to_string()))?;
        if placement.kind() != instance.placement.borrow().kind() {
            log::warn!("Ignoring placement of a different kind for {id}");
            return Ok(());
        }
        *instance.placement.borrow_mut() = placement;
        Ok(())
    }

    /// Advance the clock by `seconds` and pump. Also starts a new log budget
    /// window for every instance.
    pub fn tick(&mut self, seconds: f64) {
        for instance in self.instances.values() {
            instance.sandbox.borrow().logger().reset_budget();
        }
        let clock = self.inputs.clock.get().advanced(seconds);
        self.inputs.clock.set(clock);
        self.pump();
    }

    pub fn set_clock(&mut self, clock: ClockState) {
        self.inputs.clock.set(clock);
        self.pump();
    }

    pub fn resize(&mut self, viewport: Viewport) {
        self.inputs.viewport.set(viewport);
        self.pump();
    }

    /// Replace the scene-wide base property (`visualizer.property`).
    pub fn set_scene_property(&mut self, property: Value) {
        if self.scene_property.set_base(property) {
            self.inputs.scene_property.set(self.scene_property.get());
        }
        self.pump();
    }

    /// Editor-side patch over the scene property, or `None` to drop it.
    pub fn override_scene_property(&mut self, patch: Option<Value>) {
        if self.scene_property.set(COMMON_KEY, patch) {
            self.inputs.scene_property.set(self.scene_property.get());
        }
        self.pump();
    }

    /// Editor-side layer override. Merged before every extension's patch.
    pub fn override_property(&mut self, layer_id: &str, patch: Option<Value>) {
        self.store.override_property(layer_id, COMMON_KEY, patch);
        self.pump();
    }

    pub fn set_tags(&mut self, tags: Vec<Tag>) {
        self.inputs.tags.set(Rc::new(tags));
        self.pump();
    }

    /// Bring every instance up to date with the host and apply what they
    /// asked for.
    pub fn pump(&mut self) {
        let max_rounds = self.ctx.config.max_pump_rounds.max(1);
        let mut pointer_events = self.engine.drain_mouse_events();
        for round in 1..=max_rounds {
            let common = self.compose();
            let ids = self.registry.ids().to_vec();
            for id in &ids {
                let Some(instance) = self.instances.get_mut(id) else {
                    continue;
                };
                let surface = instance.surfaces.surface_for(&common);
                let mut sandbox = instance.sandbox.borrow_mut();
                sandbox.link().set(surface);
                for event in instance.sync.observe(&common) {
                    sandbox.dispatch(&event).ok();
                }
                for pointer in &pointer_events {
                    if let Some(event) = instance.sync.forward_pointer(pointer) {
                        sandbox.dispatch(&event).ok();
                    }
                }
            }
            pointer_events.clear();

            let mut applied_any = false;
            for id in &ids {
                let commands = match self.instances.get(id) {
                    Some(instance) => instance.commands().drain(),
                    None => continue,
                };
                for command in commands {
                    applied_any = true;
                    self.apply(id, command);
                }
            }
            if !applied_any {
                return;
            }
            if round == max_rounds {
                log::warn!(
                    "Pump stopped after {max_rounds} rounds; remaining commands wait for the next pump"
                );
            }
        }
    }

    fn apply(&mut self, sender: &str, command: Command) {
        log::debug!("[{sender}] {}", command.name());
        match &command {
            Command::FlyTo {
                destination,
                options,
            } => self.engine.fly_to(destination, options),
            Command::LookAt {
                destination,
                options,
            } => self.engine.look_at(destination, options),
            Command::ZoomIn(amount) => self.engine.zoom_in(*amount),
            Command::ZoomOut(amount) => self.engine.zoom_out(*amount),
            Command::Select { layer_id, reason } => {
                self.host.select(layer_id.as_deref(), reason.as_deref())
            }
            Command::Show(ids) => self.host.show(ids),
            Command::Hide(ids) => self.host.hide(ids),
            Command::OverrideProperty { layer_id, patch } => {
                self.store.override_property(layer_id, sender, patch.clone());
            }
            Command::AddLayer { layer, parent_id } => {
                let creator = self.instances.get(sender).map(|i| i.extension_id.clone());
                if let Some(id) =
                    self.host
                        .add_layer(layer.clone(), parent_id.as_deref(), creator.as_deref())
                {
                    log::debug!("[{sender}] added layer {id}");
                }
            }
            Command::PostMessage { target, message } => {
                if let RouteOutcome::Failed(err) = self.registry.route(target, message.clone(), sender)
                {
                    self.diagnostics.push(ExtensionDiagnostic::from_bridge_error(
                        target,
                        DiagnosticPhase::Message,
                        &err,
                    ));
                }
            }
        }
        self.applied.push(AppliedCommand {
            instance_id: sender.to_string(),
            command,
        });
    }

    pub fn kind_of(&self, id: &str) -> Option<ExtensionKind> {
        self.registry.get(id).map(|r| r.kind)
    }
}

/// Count of applied commands by name.
pub fn command_counts(applied: &[AppliedCommand]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in applied {
        *counts.entry(entry.command.name().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Delivery closure bound in the registry. A sandbox that is currently
/// running reports itself busy rather than being re-entered.
fn sender_for(sandbox: &Rc<RefCell<ExtensionSandbox>>) -> SendFn {
    let sandbox = Rc::clone(sandbox);
    Rc::new(move |message: &RoutedMessage| -> BridgeResult<()> {
        let mut sandbox = sandbox
            .try_borrow_mut()
            .map_err(|_| BridgeError::RecipientBusy(message.target.clone()))?;
        sandbox.receive(message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraRecord;
    use crate::capability::{BlockInfo, WidgetInfo};
    use crate::host::{HeadlessEngine, TreeHost};
    use crate::layer::Layer;
    use serde_json::json;

    fn shell() -> EditorShell<HeadlessEngine, TreeHost> {
        let tree = Layer::new("root").with_children(vec![
            Layer::new("a"),
            Layer::new("b").with_children(vec![Layer::new("b1")]),
        ]);
        EditorShell::new(
            BridgeContext::new(BridgeConfig::default()),
            HeadlessEngine::new("headless"),
            TreeHost::new(tree),
        )
    }

    fn widget(id: &str, source: &str) -> MountRequest {
        MountRequest {
            instance_id: id.to_string(),
            extension_id: "ext".to_string(),
            placement: Placement::Widget(WidgetInfo {
                id: format!("{id}-placement"),
                extension_id: "ext".to_string(),
                property: json!({}),
                extended: false,
            }),
            source: source.to_string(),
        }
    }

    #[test]
    fn test_commands_apply_once() {
        let mut shell = shell();
        shell
            .mount(widget("w1", r#"api.layers.hide("a"); api.visualizer.camera.zoomIn(1);"#))
            .unwrap();
        let applied = shell.take_applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(shell.host().tree().find("a").map(|l| l.visible), Some(false));
        assert_eq!(shell.engine().calls().len(), 1);

        shell.pump();
        assert!(shell.take_applied().is_empty());
    }

    #[test]
    fn test_select_triggers_event() {
        let mut shell = shell();
        shell
            .mount(widget(
                "w1",
                r#"api.on("select", |id| { if id != () { api.layers.hide(id); } });"#,
            ))
            .unwrap();
        shell.host_mut().select(Some("b"), None);
        shell.pump();
        assert_eq!(shell.host().tree().find("b").map(|l| l.visible), Some(false));
        assert!(shell.store().find_by_id("b1").is_none());
    }

    #[test]
    fn test_placement_edit_is_seen_on_next_read() {
        let mut shell = shell();
        shell
            .mount(widget(
                "w1",
                r#"api.on("select", |id| { log.info(api.widget.id); log.info(api.block == ()); });"#,
            ))
            .unwrap();

        let moved = Placement::Widget(WidgetInfo {
            id: "moved".to_string(),
            extension_id: "ext".to_string(),
            property: json!({}),
            extended: true,
        });
        shell.set_placement("w1", moved).unwrap();
        shell.host_mut().select(Some("a"), None);
        shell.pump();

        // A placement of another kind is ignored.
        let block = Placement::Block(BlockInfo {
            id: "blk".to_string(),
            extension_id: "ext".to_string(),
            property: json!({}),
        });
        shell.set_placement("w1", block).unwrap();
        shell.host_mut().select(Some("b"), None);
        shell.pump();

        let logs: Vec<String> = shell
            .instance_logs("w1")
            .into_iter()
            .map(|line| line.message)
            .collect();
        assert_eq!(logs, vec!["moved", "true", "moved", "true"]);
        assert_eq!(shell.kind_of("w1"), Some(ExtensionKind::Widget));
        assert!(matches!(
            shell.set_placement("missing", Placement::Primitive { layer_id: "a".into() }),
            Err(BridgeError::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_unchanged_camera_is_silent() {
        let mut shell = shell();
        shell.engine_mut().set_camera(Some(CameraRecord::default()));
        shell
            .mount(widget(
                "w1",
                r#"let n = 0; api.on("cameramove", |c| { n += 1; api.layers.hide("x" + n); });"#,
            ))
            .unwrap();
        for _ in 0..100 {
            shell.engine_mut().set_camera(Some(CameraRecord::default()));
            shell.pump();
        }
        assert!(shell.take_applied().is_empty());
    }

    #[test]
    fn test_overrides_keyed_by_instance_and_cleared_on_unmount() {
        let mut shell = shell();
        shell
            .mount(widget("w1", r#"api.layers.overrideProperty("a", #{ color: "red" });"#))
            .unwrap();
        let view = shell.store().find_by_id("a").unwrap();
        assert_eq!(view.property(), Some(json!({ "color": "red" })));
        shell.unmount("w1").unwrap();
        assert_eq!(view.property(), Some(serde_json::Value::Null));
    }

    #[test]
    fn test_editor_override_loses_to_extension() {
        let mut shell = shell();
        shell
            .mount(widget("w1", r#"api.layers.overrideProperty("a", #{ color: "red" });"#))
            .unwrap();
        shell.override_property("a", Some(json!({ "color": "blue", "width": 1 })));
        let view = shell.store().find_by_id("a").unwrap();
        assert_eq!(view.property(), Some(json!({ "color": "red", "width": 1 })));
    }

    #[test]
    fn test_scene_property_patch() {
        let mut shell = shell();
        shell
            .mount(widget(
                "w1",
                r#"api.on("update", || { log.info(api.visualizer.property.tone); });"#,
            ))
            .unwrap();
        shell.set_scene_property(json!({ "tone": "dark", "fog": true }));
        shell.override_scene_property(Some(json!({ "tone": "light" })));
        let logs: Vec<String> = shell.instance_logs("w1").into_iter().map(|l| l.message).collect();
        assert_eq!(logs, vec!["dark", "light"]);
    }

    #[test]
    fn test_reload_counts_runs() {
        let mut shell = shell();
        shell.mount(widget("w1", "let x = 1;")).unwrap();
        shell.reload("w1", None).unwrap();
        shell.reload("w1", Some("let y = 2;".into())).unwrap();
        assert_eq!(shell.run_count("w1"), Some(3));
        shell.reset_run_count(Some("w1"));
        assert_eq!(shell.run_count("w1"), Some(0));
    }

    #[test]
    fn test_command_counts_by_name() {
        let mut shell = shell();
        shell
            .mount(widget("w1", r#"api.layers.hide("a"); api.layers.show("a"); api.layers.hide("a");"#))
            .unwrap();
        let counts = command_counts(&shell.take_applied());
        assert_eq!(counts.get("hide"), Some(&2));
        assert_eq!(counts.get("show"), Some(&1));
    }

    #[test]
    fn test_failed_load_stays_mounted() {
        let mut shell = shell();
        assert!(shell.mount(widget("w1", "let = ;")).is_err());
        assert_eq!(shell.run_count("w1"), Some(1));
        assert!(!shell.registry().is_bound("w1"));
        assert_eq!(shell.instance_diagnostics("w1").len(), 1);
        shell.reload("w1", Some("let ok = true;".into())).unwrap();
        assert!(shell.registry().is_bound("w1"));
    }

    #[test]
    fn test_inspect_hook_requires_flag() {
        let seen = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&seen);
        let config = BridgeConfig {
            debug_inspect: true,
            ..Default::default()
        };
        let ctx = BridgeContext::new(config).with_inspect(Box::new(move |_| {
            *counter.borrow_mut() += 1;
        }));
        let mut shell = EditorShell::new(ctx, HeadlessEngine::new("e"), TreeHost::new(Layer::new("r")));
        shell.pump();
        shell.tick(1.0);
        assert_eq!(*seen.borrow(), 2);
    }
}
