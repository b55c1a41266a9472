//! Rhai projection of a capability surface.
//!
//! Extension scripts see one global `api` map:
//!
//! - `api.version`, `api.apiVersion`, `api.instanceId`
//! - `api.visualizer.engine`, `api.visualizer.property`
//! - `api.visualizer.camera.position`, `.flyTo(dest[, opts])`,
//!   `.lookAt(dest[, opts])`, `.zoomIn(amount)`, `.zoomOut(amount)`
//! - `api.layers.layers`, `.selected`, `.selectionReason`,
//!   `.overriddenInfobox`, `.tags`, `.findById(id)`, `.findByIds(ids)`,
//!   `.select(id[, reason])`, `.show(ids)`, `.hide(ids)`,
//!   `.overrideProperty(id, patch)`, `.add(layer[, parentId])`
//! - `api.clock.currentTime` / `startTime` / `stopTime` (epoch millis),
//!   `.playing`, `.multiplier`
//! - `api.viewport.width` / `height` / `isMobile`
//! - exactly one of `api.layer`, `api.block`, `api.widget`
//! - `api.on(name, fn)`, `api.once(name, fn)`, `api.off(name[, fn])`,
//!   `api.postMessage(target, message)`
//!
//! Every handle resolves against the instance's current surface when a
//! property is read; nothing is copied at load time. Commands go into the
//! instance's command port and are applied by the shell after the script
//! returns.

use std::cell::RefCell;
use std::rc::Rc;

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, INT};
use serde_json::Value;

use crate::camera::{CameraDestination, FlightOptions};
use crate::capability::{CapabilitySurface, ExtensionKind};
use crate::error::BridgeError;
use crate::events::{EventHub, EventName};
use crate::layer::Layer;
use crate::marshal::{to_json, to_script};
use crate::snapshot::LayerView;

/// Handler registry shared between the sandbox and the registered functions.
pub type HandlerHub = Rc<RefCell<EventHub<FnPtr>>>;

/// The instance's view of its current surface.
#[derive(Debug)]
pub struct SurfaceLink {
    instance_id: String,
    current: RefCell<Option<Rc<CapabilitySurface>>>,
    refusals: RefCell<Vec<BridgeError>>,
}

impl SurfaceLink {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            current: RefCell::new(None),
            refusals: RefCell::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn set(&self, surface: Rc<CapabilitySurface>) {
        *self.current.borrow_mut() = Some(surface);
    }

    pub fn surface(&self) -> Option<Rc<CapabilitySurface>> {
        self.current.borrow().clone()
    }

    /// Values the script tried to hand over that could not cross.
    pub fn take_refusals(&self) -> Vec<BridgeError> {
        std::mem::take(&mut *self.refusals.borrow_mut())
    }

    /// Marshal `value`, remembering the refusal if it cannot cross.
    fn marshal(&self, path: &str, value: &Dynamic) -> Option<Value> {
        match to_json(&self.instance_id, path, value) {
            Ok(json) => Some(json),
            Err(err) => {
                self.refusals.borrow_mut().push(err);
                None
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&CapabilitySurface) -> R) -> Option<R> {
        let surface = self.surface()?;
        Some(f(&surface))
    }
}

type Link = Rc<SurfaceLink>;

#[derive(Clone)]
pub struct VisualizerApi(Link);
#[derive(Clone)]
pub struct CameraApi(Link);
#[derive(Clone)]
pub struct LayersApi(Link);
#[derive(Clone)]
pub struct ClockApi(Link);
#[derive(Clone)]
pub struct ViewportApi(Link);
/// `api.layer`, `api.block` or `api.widget`, evaluated on each read.
#[derive(Clone)]
pub struct KindApi(Link);
#[derive(Clone)]
pub struct LayerHandle(LayerView);

fn opt<T: Clone + 'static>(value: Option<T>) -> Dynamic {
    value.map(Dynamic::from).unwrap_or(Dynamic::UNIT)
}

fn json_or_unit(value: Option<Value>) -> Dynamic {
    value.map(|v| to_script(&v)).unwrap_or(Dynamic::UNIT)
}

fn layer_or_unit(view: Option<LayerView>) -> Dynamic {
    view.map(|v| Dynamic::from(LayerHandle(v)))
        .unwrap_or(Dynamic::UNIT)
}

fn string_list(value: &Dynamic) -> Vec<String> {
    if let Some(arr) = value.read_lock::<Array>() {
        return arr
            .iter()
            .filter_map(|v| v.clone().into_string().ok())
            .collect();
    }
    value.clone().into_string().map(|s| vec![s]).unwrap_or_default()
}

fn script_error(message: String) -> Box<EvalAltResult> {
    message.into()
}

/// Build the `api` map for one instance.
pub fn build_api_map(link: &Link, kind: ExtensionKind, version: &str, api_version: u32) -> Map {
    let mut map = Map::new();
    map.insert("version".into(), Dynamic::from(version.to_string()));
    map.insert("apiVersion".into(), Dynamic::from(api_version as INT));
    map.insert(
        "instanceId".into(),
        Dynamic::from(link.instance_id().to_string()),
    );
    map.insert(
        "visualizer".into(),
        Dynamic::from(VisualizerApi(Rc::clone(link))),
    );
    map.insert("layers".into(), Dynamic::from(LayersApi(Rc::clone(link))));
    map.insert("clock".into(), Dynamic::from(ClockApi(Rc::clone(link))));
    map.insert(
        "viewport".into(),
        Dynamic::from(ViewportApi(Rc::clone(link))),
    );
    map.insert(
        kind.field_name().into(),
        Dynamic::from(KindApi(Rc::clone(link))),
    );
    map
}

/// Register the surface types and the `api` methods on `engine`.
pub fn register_surface_api(engine: &mut Engine, link: &Link, hub: &HandlerHub) {
    register_events(engine, link, hub);
    register_visualizer(engine);
    register_layers(engine);
    register_clock_and_viewport(engine);
    register_kind(engine);
    register_layer_handle(engine);
}

fn register_events(engine: &mut Engine, link: &Link, hub: &HandlerHub) {
    fn parse(name: &str) -> Result<EventName, Box<EvalAltResult>> {
        EventName::parse(name).ok_or_else(|| script_error(format!("unknown event `{name}`")))
    }

    let h = Rc::clone(hub);
    engine.register_fn(
        "on",
        move |_api: Map, name: ImmutableString, handler: FnPtr| -> Result<(), Box<EvalAltResult>> {
            h.borrow_mut().on(parse(&name)?, handler);
            Ok(())
        },
    );
    let h = Rc::clone(hub);
    engine.register_fn(
        "once",
        move |_api: Map, name: ImmutableString, handler: FnPtr| -> Result<(), Box<EvalAltResult>> {
            h.borrow_mut().once(parse(&name)?, handler);
            Ok(())
        },
    );
    let h = Rc::clone(hub);
    engine.register_fn(
        "off",
        move |_api: Map, name: ImmutableString, handler: FnPtr| -> Result<INT, Box<EvalAltResult>> {
            let removed = h
                .borrow_mut()
                .off(parse(&name)?, |f| f.fn_name() == handler.fn_name());
            Ok(removed as INT)
        },
    );
    let h = Rc::clone(hub);
    engine.register_fn(
        "off",
        move |_api: Map, name: ImmutableString| -> Result<INT, Box<EvalAltResult>> {
            Ok(h.borrow_mut().off(parse(&name)?, |_| true) as INT)
        },
    );

    let l = Rc::clone(link);
    engine.register_fn(
        "postMessage",
        move |_api: Map, target: ImmutableString, message: Dynamic| {
            let Some(payload) = l.marshal("message", &message) else {
                return;
            };
            l.read(|s| s.commands.post_message(target.to_string(), payload));
        },
    );
}

fn destination(link: &SurfaceLink, value: &Dynamic) -> Option<CameraDestination> {
    if value.is_unit() {
        return None;
    }
    let json = link.marshal("destination", value)?;
    match serde_json::from_value::<CameraDestination>(json) {
        Ok(dest) if !dest.is_empty() => Some(dest),
        Ok(_) => None,
        Err(err) => {
            log::warn!("[{}] ignoring camera destination: {err}", link.instance_id());
            None
        }
    }
}

fn flight_options(link: &SurfaceLink, value: &Dynamic) -> FlightOptions {
    link.marshal("options", value)
        .and_then(|json| serde_json::from_value(json).ok())
        .unwrap_or_default()
}

fn register_visualizer(engine: &mut Engine) {
    engine
        .register_type_with_name::<VisualizerApi>("Visualizer")
        .register_get("engine", |v: &mut VisualizerApi| {
            opt(v.0.read(|s| s.visualizer().engine.clone()))
        })
        .register_get("property", |v: &mut VisualizerApi| {
            json_or_unit(v.0.read(|s| s.visualizer().property.clone()))
        })
        .register_get("camera", |v: &mut VisualizerApi| CameraApi(Rc::clone(&v.0)));

    engine
        .register_type_with_name::<CameraApi>("Camera")
        .register_get("position", |c: &mut CameraApi| {
            let camera = c.0.read(|s| s.visualizer().camera).flatten();
            json_or_unit(camera.and_then(|cam| serde_json::to_value(cam).ok()))
        })
        .register_fn("flyTo", |c: &mut CameraApi, dest: Dynamic| {
            let dest = destination(&c.0, &dest);
            c.0.read(|s| s.commands.fly_to(dest, FlightOptions::default()));
        })
        .register_fn("flyTo", |c: &mut CameraApi, dest: Dynamic, options: Dynamic| {
            let dest = destination(&c.0, &dest);
            let options = flight_options(&c.0, &options);
            c.0.read(|s| s.commands.fly_to(dest, options));
        })
        .register_fn("lookAt", |c: &mut CameraApi, dest: Dynamic| {
            let dest = destination(&c.0, &dest);
            c.0.read(|s| s.commands.look_at(dest, FlightOptions::default()));
        })
        .register_fn("lookAt", |c: &mut CameraApi, dest: Dynamic, options: Dynamic| {
            let dest = destination(&c.0, &dest);
            let options = flight_options(&c.0, &options);
            c.0.read(|s| s.commands.look_at(dest, options));
        })
        .register_fn("zoomIn", |c: &mut CameraApi, amount: Dynamic| {
            if let Some(amount) = as_number(&amount) {
                c.0.read(|s| s.commands.zoom_in(amount));
            }
        })
        .register_fn("zoomOut", |c: &mut CameraApi, amount: Dynamic| {
            if let Some(amount) = as_number(&amount) {
                c.0.read(|s| s.commands.zoom_out(amount));
            }
        });
}

fn as_number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|i| i as f64))
}

fn register_layers(engine: &mut Engine) {
    engine
        .register_type_with_name::<LayersApi>("Layers")
        .register_get("layers", |l: &mut LayersApi| {
            let views = l.0.read(|s| s.layers().layers()).unwrap_or_default();
            Dynamic::from_array(views.into_iter().map(|v| Dynamic::from(LayerHandle(v))).collect())
        })
        .register_get("selected", |l: &mut LayersApi| {
            layer_or_unit(l.0.read(|s| s.layers().selected()).flatten())
        })
        .register_get("selectionReason", |l: &mut LayersApi| {
            opt(l.0.read(|s| s.layers().selection.reason.clone()).flatten())
        })
        .register_get("overriddenInfobox", |l: &mut LayersApi| {
            json_or_unit(
                l.0.read(|s| s.layers().selection.overridden_infobox.clone())
                    .flatten(),
            )
        })
        .register_get("tags", |l: &mut LayersApi| {
            json_or_unit(l.0.read(|s| serde_json::to_value(s.layers().tags.as_ref()).ok()).flatten())
        })
        .register_fn("findById", |l: &mut LayersApi, id: ImmutableString| {
            layer_or_unit(l.0.read(|s| s.layers().find_by_id(&id)).flatten())
        })
        .register_fn("findByIds", |l: &mut LayersApi, ids: Array| {
            let ids: Vec<String> = ids
                .into_iter()
                .map(|id| id.into_string().unwrap_or_default())
                .collect();
            let found = l.0.read(|s| s.layers().find_by_ids(&ids)).unwrap_or_default();
            Dynamic::from_array(found.into_iter().map(layer_or_unit).collect())
        })
        .register_fn("select", |l: &mut LayersApi, id: Dynamic| {
            let id = id.into_string().ok();
            l.0.read(|s| s.commands.select(id, None));
        })
        .register_fn("select", |l: &mut LayersApi, id: Dynamic, reason: ImmutableString| {
            let id = id.into_string().ok();
            l.0.read(|s| s.commands.select(id, Some(reason.to_string())));
        })
        .register_fn("show", |l: &mut LayersApi, ids: Dynamic| {
            let ids = string_list(&ids);
            l.0.read(|s| s.commands.show(ids));
        })
        .register_fn("hide", |l: &mut LayersApi, ids: Dynamic| {
            let ids = string_list(&ids);
            l.0.read(|s| s.commands.hide(ids));
        })
        .register_fn(
            "overrideProperty",
            |l: &mut LayersApi, id: ImmutableString, patch: Dynamic| {
                let patch = if patch.is_unit() {
                    None
                } else {
                    match l.0.marshal("property", &patch) {
                        Some(json) => Some(json),
                        None => return,
                    }
                };
                l.0.read(|s| s.commands.override_property(id.to_string(), patch));
            },
        )
        .register_fn("add", |l: &mut LayersApi, layer: Dynamic| {
            add_layer(&l.0, &layer, None);
        })
        .register_fn("add", |l: &mut LayersApi, layer: Dynamic, parent: ImmutableString| {
            add_layer(&l.0, &layer, Some(parent.to_string()));
        });
}

fn add_layer(link: &SurfaceLink, value: &Dynamic, parent_id: Option<String>) {
    let Some(mut json) = link.marshal("layer", value) else {
        return;
    };
    if let Value::Object(fields) = &mut json {
        fields
            .entry("id")
            .or_insert_with(|| Value::String(String::new()));
    }
    match serde_json::from_value::<Layer>(json) {
        Ok(layer) => {
            link.read(|s| s.commands.add_layer(layer, parent_id));
        }
        Err(err) => log::warn!("[{}] ignoring layer: {err}", link.instance_id()),
    }
}

fn register_clock_and_viewport(engine: &mut Engine) {
    engine
        .register_type_with_name::<ClockApi>("Clock")
        .register_get("currentTime", |c: &mut ClockApi| {
            opt(c.0.read(|s| s.common.clock.current_time.timestamp_millis() as INT))
        })
        .register_get("startTime", |c: &mut ClockApi| {
            opt(c.0.read(|s| s.common.clock.start_time.timestamp_millis() as INT))
        })
        .register_get("stopTime", |c: &mut ClockApi| {
            opt(c.0.read(|s| s.common.clock.stop_time.timestamp_millis() as INT))
        })
        .register_get("playing", |c: &mut ClockApi| {
            opt(c.0.read(|s| s.common.clock.playing))
        })
        .register_get("multiplier", |c: &mut ClockApi| {
            opt(c.0.read(|s| s.common.clock.multiplier))
        });

    engine
        .register_type_with_name::<ViewportApi>("Viewport")
        .register_get("width", |v: &mut ViewportApi| {
            opt(v.0.read(|s| s.common.viewport.width as INT))
        })
        .register_get("height", |v: &mut ViewportApi| {
            opt(v.0.read(|s| s.common.viewport.height as INT))
        })
        .register_get("isMobile", |v: &mut ViewportApi| {
            opt(v.0.read(|s| s.common.viewport.is_mobile))
        });
}

/// Kind fields. Primitive surfaces answer with the attached layer's fields;
/// block and widget surfaces with their placement.
fn register_kind(engine: &mut Engine) {
    fn layer(k: &KindApi) -> Option<LayerView> {
        k.0.read(|s| s.layer()).flatten()
    }
    fn placement(k: &KindApi) -> Option<(String, String, Value, Option<bool>)> {
        k.0.read(|s| {
            s.block()
                .map(|b| (b.id, b.extension_id, b.property, None))
                .or_else(|| {
                    s.widget()
                        .map(|w| (w.id, w.extension_id, w.property, Some(w.extended)))
                })
        })
        .flatten()
    }

    engine
        .register_type_with_name::<KindApi>("Kind")
        .register_get("id", |k: &mut KindApi| match layer(k) {
            Some(view) => Dynamic::from(view.id().to_string()),
            None => opt(placement(k).map(|p| p.0)),
        })
        .register_get("extensionId", |k: &mut KindApi| match layer(k) {
            Some(view) => opt(view.extension_id()),
            None => opt(placement(k).map(|p| p.1)),
        })
        .register_get("property", |k: &mut KindApi| match layer(k) {
            Some(view) => json_or_unit(view.property()),
            None => json_or_unit(placement(k).map(|p| p.2)),
        })
        .register_get("title", |k: &mut KindApi| opt(layer(k).and_then(|v| v.title())))
        .register_get("infobox", |k: &mut KindApi| {
            json_or_unit(layer(k).and_then(|v| v.infobox()))
        })
        .register_get("extended", |k: &mut KindApi| opt(placement(k).and_then(|p| p.3)))
        .register_get("exists", |k: &mut KindApi| {
            layer(k).is_some() || placement(k).is_some()
        });
}

fn register_layer_handle(engine: &mut Engine) {
    engine
        .register_type_with_name::<LayerHandle>("LayerView")
        .register_get("id", |h: &mut LayerHandle| h.0.id().to_string())
        .register_get("isLive", |h: &mut LayerHandle| h.0.is_live())
        .register_get("title", |h: &mut LayerHandle| opt(h.0.title()))
        .register_get("visible", |h: &mut LayerHandle| opt(h.0.visible()))
        .register_get("property", |h: &mut LayerHandle| json_or_unit(h.0.property()))
        .register_get("infobox", |h: &mut LayerHandle| json_or_unit(h.0.infobox()))
        .register_get("tags", |h: &mut LayerHandle| {
            opt(h.0.tags().map(|tags| {
                tags.into_iter().map(Dynamic::from).collect::<Array>()
            }))
        })
        .register_get("extensionId", |h: &mut LayerHandle| opt(h.0.extension_id()))
        .register_get("children", |h: &mut LayerHandle| {
            opt(h.0.children().map(|children| {
                children
                    .into_iter()
                    .map(|v| Dynamic::from(LayerHandle(v)))
                    .collect::<Array>()
            }))
        })
        .register_fn("to_string", |h: &mut LayerHandle| format!("LayerView({})", h.0.id()));
}
