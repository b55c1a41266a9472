//! Capability surface composition.
//!
//! A surface is the object graph one extension instance may see: a common
//! slice shared by every instance plus exactly one kind slice picked by the
//! instance's declared [`ExtensionKind`]. Kind slices are thunks evaluated on
//! access, so the value an extension reads is the one current at read time.
//!
//! Composition is memoized by input version: a sub-slice whose inputs did not
//! change keeps its `Rc` identity across rebuilds, so consumers comparing by
//! pointer skip needless work.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::camera::{CameraDestination, CameraRecord, FlightOptions};
use crate::host::{ClockState, HostInputs, Selection, Viewport};
use crate::layer::{Layer, Tag};
use crate::snapshot::{LayerView, SnapshotStore};

/// Declared kind of an extension; selects its kind slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    Primitive,
    Block,
    Widget,
}

impl ExtensionKind {
    /// Name of the one kind field the surface exposes.
    pub fn field_name(&self) -> &'static str {
        match self {
            ExtensionKind::Primitive => "layer",
            ExtensionKind::Block => "block",
            ExtensionKind::Widget => "widget",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtensionKind::Primitive => "primitive",
            ExtensionKind::Block => "block",
            ExtensionKind::Widget => "widget",
        };
        f.write_str(s)
    }
}

/// Infobox block placement as seen by its extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub id: String,
    pub extension_id: String,
    #[serde(default)]
    pub property: Value,
}

/// Widget placement as seen by its extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetInfo {
    pub id: String,
    pub extension_id: String,
    #[serde(default)]
    pub property: Value,
    #[serde(default)]
    pub extended: bool,
}

/// Where an instance lives in the editor. Determines its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Placement {
    #[serde(rename_all = "camelCase")]
    Primitive { layer_id: String },
    Block(BlockInfo),
    Widget(WidgetInfo),
}

impl Placement {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            Placement::Primitive { .. } => ExtensionKind::Primitive,
            Placement::Block(_) => ExtensionKind::Block,
            Placement::Widget(_) => ExtensionKind::Widget,
        }
    }

    /// Thunks reading `cell` at call time, so placement edits are seen by the
    /// next access without recomposing.
    pub fn thunks(cell: &Rc<RefCell<Placement>>, store: &SnapshotStore) -> KindThunks {
        let mut thunks = KindThunks::default();
        match cell.borrow().kind() {
            ExtensionKind::Primitive => {
                let (cell, store) = (Rc::clone(cell), store.clone());
                thunks.layer = Some(Rc::new(move || match &*cell.borrow() {
                    Placement::Primitive { layer_id } => store.find_by_id(layer_id),
                    _ => None,
                }));
            }
            ExtensionKind::Block => {
                let cell = Rc::clone(cell);
                thunks.block = Some(Rc::new(move || match &*cell.borrow() {
                    Placement::Block(info) => Some(info.clone()),
                    _ => None,
                }));
            }
            ExtensionKind::Widget => {
                let cell = Rc::clone(cell);
                thunks.widget = Some(Rc::new(move || match &*cell.borrow() {
                    Placement::Widget(info) => Some(info.clone()),
                    _ => None,
                }));
            }
        }
        thunks
    }
}

/// Deferred accessor for a kind-specific value.
pub type Thunk<T> = Rc<dyn Fn() -> Option<T>>;

/// Accessors the host can offer; only the one matching the kind survives.
#[derive(Clone, Default)]
pub struct KindThunks {
    pub layer: Option<Thunk<LayerView>>,
    pub block: Option<Thunk<BlockInfo>>,
    pub widget: Option<Thunk<WidgetInfo>>,
}

/// The single kind-specific slice of a surface.
#[derive(Clone)]
pub enum KindSlice {
    Layer(Option<Thunk<LayerView>>),
    Block(Option<Thunk<BlockInfo>>),
    Widget(Option<Thunk<WidgetInfo>>),
}

impl KindSlice {
    pub fn select(kind: ExtensionKind, thunks: KindThunks) -> Self {
        match kind {
            ExtensionKind::Primitive => KindSlice::Layer(thunks.layer),
            ExtensionKind::Block => KindSlice::Block(thunks.block),
            ExtensionKind::Widget => KindSlice::Widget(thunks.widget),
        }
    }

    pub fn kind(&self) -> ExtensionKind {
        match self {
            KindSlice::Layer(_) => ExtensionKind::Primitive,
            KindSlice::Block(_) => ExtensionKind::Block,
            KindSlice::Widget(_) => ExtensionKind::Widget,
        }
    }
}

/// A command an extension issued; applied to the host once, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FlyTo {
        destination: CameraDestination,
        options: FlightOptions,
    },
    LookAt {
        destination: CameraDestination,
        options: FlightOptions,
    },
    ZoomIn(f64),
    ZoomOut(f64),
    Select {
        layer_id: Option<String>,
        reason: Option<String>,
    },
    Show(Vec<String>),
    Hide(Vec<String>),
    OverrideProperty {
        layer_id: String,
        patch: Option<Value>,
    },
    AddLayer {
        layer: Layer,
        parent_id: Option<String>,
    },
    PostMessage {
        target: String,
        message: Value,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::FlyTo { .. } => "flyTo",
            Command::LookAt { .. } => "lookAt",
            Command::ZoomIn(_) => "zoomIn",
            Command::ZoomOut(_) => "zoomOut",
            Command::Select { .. } => "select",
            Command::Show(_) => "show",
            Command::Hide(_) => "hide",
            Command::OverrideProperty { .. } => "overrideProperty",
            Command::AddLayer { .. } => "addLayer",
            Command::PostMessage { .. } => "postMessage",
        }
    }
}

/// Outbox of one instance. Calls never touch the host directly; the shell
/// drains the queue after the extension returns control.
#[derive(Debug)]
pub struct CommandPort {
    instance_id: String,
    queue: RefCell<VecDeque<Command>>,
}

impl CommandPort {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn push(&self, command: Command) {
        self.queue.borrow_mut().push_back(command);
    }

    /// No-op when the destination is absent.
    pub fn fly_to(&self, destination: Option<CameraDestination>, options: FlightOptions) {
        if let Some(destination) = destination {
            self.push(Command::FlyTo {
                destination,
                options,
            });
        }
    }

    /// No-op when the destination is absent.
    pub fn look_at(&self, destination: Option<CameraDestination>, options: FlightOptions) {
        if let Some(destination) = destination {
            self.push(Command::LookAt {
                destination,
                options,
            });
        }
    }

    pub fn zoom_in(&self, amount: f64) {
        self.push(Command::ZoomIn(amount));
    }

    pub fn zoom_out(&self, amount: f64) {
        self.push(Command::ZoomOut(amount));
    }

    pub fn select(&self, layer_id: Option<String>, reason: Option<String>) {
        self.push(Command::Select { layer_id, reason });
    }

    pub fn show(&self, ids: Vec<String>) {
        self.push(Command::Show(ids));
    }

    pub fn hide(&self, ids: Vec<String>) {
        self.push(Command::Hide(ids));
    }

    pub fn override_property(&self, layer_id: String, patch: Option<Value>) {
        self.push(Command::OverrideProperty { layer_id, patch });
    }

    pub fn add_layer(&self, layer: Layer, parent_id: Option<String>) {
        self.push(Command::AddLayer { layer, parent_id });
    }

    pub fn post_message(&self, target: String, message: Value) {
        self.push(Command::PostMessage { target, message });
    }

    pub fn drain(&self) -> Vec<Command> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

#[derive(Debug)]
pub struct VisualizerSlice {
    pub engine: String,
    pub camera: Option<CameraRecord>,
    pub property: Value,
}

#[derive(Debug)]
pub struct LayersSlice {
    pub store: SnapshotStore,
    pub selection: Selection,
    pub tags: Rc<Vec<Tag>>,
}

impl LayersSlice {
    pub fn layers(&self) -> Vec<LayerView> {
        self.store.layers()
    }

    pub fn selected(&self) -> Option<LayerView> {
        self.selection
            .layer_id
            .as_deref()
            .and_then(|id| self.store.find_by_id(id))
    }

    pub fn find_by_id(&self, id: &str) -> Option<LayerView> {
        self.store.find_by_id(id)
    }

    pub fn find_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Vec<Option<LayerView>> {
        self.store.find_by_ids(ids)
    }
}

/// Slices every instance sees regardless of kind.
#[derive(Debug)]
pub struct CommonSlice {
    pub version: String,
    pub api_version: u32,
    pub visualizer: Rc<VisualizerSlice>,
    pub layers: Rc<LayersSlice>,
    pub clock: ClockState,
    pub viewport: Viewport,
}

impl CommonSlice {
    /// Plain-data summary for the debug inspection hook.
    pub fn to_json(&self) -> Value {
        json!({
            "version": self.version,
            "apiVersion": self.api_version,
            "visualizer": {
                "engine": self.visualizer.engine,
                "camera": self.visualizer.camera,
                "property": self.visualizer.property,
            },
            "layers": {
                "visible": self.layers.store.snapshot().flattened_ids(),
                "selected": self.layers.selection.layer_id,
                "selectionReason": self.layers.selection.reason,
                "tags": self.layers.tags.as_ref(),
            },
            "clock": self.clock,
            "viewport": self.viewport,
        })
    }
}

/// The composed surface handed to one instance.
pub struct CapabilitySurface {
    pub common: Rc<CommonSlice>,
    pub kind: Rc<KindSlice>,
    pub commands: Rc<CommandPort>,
}

impl CapabilitySurface {
    pub fn version(&self) -> &str {
        &self.common.version
    }

    pub fn api_version(&self) -> u32 {
        self.common.api_version
    }

    pub fn visualizer(&self) -> &VisualizerSlice {
        &self.common.visualizer
    }

    pub fn layers(&self) -> &LayersSlice {
        &self.common.layers
    }

    pub fn extension_kind(&self) -> ExtensionKind {
        self.kind.kind()
    }

    /// `None` unless this is a primitive surface whose layer resolves.
    pub fn layer(&self) -> Option<LayerView> {
        match self.kind.as_ref() {
            KindSlice::Layer(Some(thunk)) => thunk(),
            _ => None,
        }
    }

    pub fn block(&self) -> Option<BlockInfo> {
        match self.kind.as_ref() {
            KindSlice::Block(Some(thunk)) => thunk(),
            _ => None,
        }
    }

    pub fn widget(&self) -> Option<WidgetInfo> {
        match self.kind.as_ref() {
            KindSlice::Widget(Some(thunk)) => thunk(),
            _ => None,
        }
    }

    /// Top-level field names, with exactly one kind field.
    pub fn field_names(&self) -> Vec<&'static str> {
        vec![
            "version",
            "apiVersion",
            "visualizer",
            "layers",
            "clock",
            "viewport",
            self.extension_kind().field_name(),
        ]
    }
}

impl fmt::Debug for CapabilitySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySurface")
            .field("kind", &self.extension_kind())
            .field("version", &self.version())
            .finish()
    }
}

/// Shallow composition of the common slice with one kind slice.
pub fn compose(
    common: Rc<CommonSlice>,
    kind: ExtensionKind,
    thunks: KindThunks,
    commands: Rc<CommandPort>,
) -> CapabilitySurface {
    CapabilitySurface {
        common,
        kind: Rc::new(KindSlice::select(kind, thunks)),
        commands,
    }
}

/// Single-entry memo keyed by an input version tuple.
struct Memo<K, V> {
    slot: Option<(K, Rc<V>)>,
}

impl<K: PartialEq, V> Memo<K, V> {
    fn new() -> Self {
        Self { slot: None }
    }

    fn get_or_build(&mut self, key: K, build: impl FnOnce() -> V) -> Rc<V> {
        if let Some((k, v)) = &self.slot {
            if *k == key {
                return Rc::clone(v);
            }
        }
        let value = Rc::new(build());
        self.slot = Some((key, Rc::clone(&value)));
        value
    }
}

type VisualizerKey = (u64, u64);
type LayersKey = (u64, u64, u64, u64);

/// Builds the common slice, reusing sub-slices whose inputs are unchanged.
pub struct CommonComposer {
    version: String,
    api_version: u32,
    engine: String,
    visualizer: Memo<VisualizerKey, VisualizerSlice>,
    layers: Memo<LayersKey, LayersSlice>,
    common: Memo<(VisualizerKey, LayersKey, u64, u64), CommonSlice>,
}

impl CommonComposer {
    pub fn new(version: impl Into<String>, api_version: u32, engine: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            api_version,
            engine: engine.into(),
            visualizer: Memo::new(),
            layers: Memo::new(),
            common: Memo::new(),
        }
    }

    pub fn compose(&mut self, inputs: &HostInputs, store: &SnapshotStore) -> Rc<CommonSlice> {
        let vis_key = (inputs.camera.version(), inputs.scene_property.version());
        let engine = &self.engine;
        let visualizer = self.visualizer.get_or_build(vis_key, || VisualizerSlice {
            engine: engine.clone(),
            camera: *inputs.camera.get(),
            property: inputs.scene_property.get().clone(),
        });

        let layers_key = (
            store.generation(),
            store.overrides_version(),
            inputs.selection.version(),
            inputs.tags.version(),
        );
        let layers = self.layers.get_or_build(layers_key, || LayersSlice {
            store: store.clone(),
            selection: inputs.selection.get().clone(),
            tags: Rc::clone(inputs.tags.get()),
        });

        let key = (
            vis_key,
            layers_key,
            inputs.clock.version(),
            inputs.viewport.version(),
        );
        let version = &self.version;
        let api_version = self.api_version;
        self.common.get_or_build(key, || CommonSlice {
            version: version.clone(),
            api_version,
            visualizer,
            layers,
            clock: *inputs.clock.get(),
            viewport: *inputs.viewport.get(),
        })
    }
}

/// Per-instance composer: the kind slice and command port are fixed, the
/// surface is rebuilt only when the common slice changes.
pub struct SurfaceComposer {
    kind: Rc<KindSlice>,
    commands: Rc<CommandPort>,
    last: Option<Rc<CapabilitySurface>>,
}

impl SurfaceComposer {
    pub fn new(kind: ExtensionKind, thunks: KindThunks, commands: Rc<CommandPort>) -> Self {
        Self {
            kind: Rc::new(KindSlice::select(kind, thunks)),
            commands,
            last: None,
        }
    }

    pub fn commands(&self) -> &Rc<CommandPort> {
        &self.commands
    }

    pub fn surface_for(&mut self, common: &Rc<CommonSlice>) -> Rc<CapabilitySurface> {
        if let Some(last) = &self.last {
            if Rc::ptr_eq(&last.common, common) {
                return Rc::clone(last);
            }
        }
        let surface = Rc::new(CapabilitySurface {
            common: Rc::clone(common),
            kind: Rc::clone(&self.kind),
            commands: Rc::clone(&self.commands),
        });
        self.last = Some(Rc::clone(&surface));
        surface
    }
}
