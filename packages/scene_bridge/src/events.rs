//! Event names, payloads and the per-instance subscription hub.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::camera::CameraRecord;
use crate::host::Viewport;

/// Pointer events forwarded from the rendering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Click,
    DoubleClick,
    MouseDown,
    MouseUp,
    RightDown,
    RightUp,
    MiddleDown,
    MiddleUp,
    MouseMove,
    MouseEnter,
    MouseLeave,
    Wheel,
}

impl PointerKind {
    pub const ALL: [PointerKind; 12] = [
        PointerKind::Click,
        PointerKind::DoubleClick,
        PointerKind::MouseDown,
        PointerKind::MouseUp,
        PointerKind::RightDown,
        PointerKind::RightUp,
        PointerKind::MiddleDown,
        PointerKind::MiddleUp,
        PointerKind::MouseMove,
        PointerKind::MouseEnter,
        PointerKind::MouseLeave,
        PointerKind::Wheel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PointerKind::Click => "click",
            PointerKind::DoubleClick => "doubleclick",
            PointerKind::MouseDown => "mousedown",
            PointerKind::MouseUp => "mouseup",
            PointerKind::RightDown => "rightdown",
            PointerKind::RightUp => "rightup",
            PointerKind::MiddleDown => "middledown",
            PointerKind::MiddleUp => "middleup",
            PointerKind::MouseMove => "mousemove",
            PointerKind::MouseEnter => "mouseenter",
            PointerKind::MouseLeave => "mouseleave",
            PointerKind::Wheel => "wheel",
        }
    }
}

/// A mouse event as reported by the engine's mouse-event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseEvent {
    pub kind: PointerKind,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    /// Layer under the pointer, if any.
    #[serde(default)]
    pub layer_id: Option<String>,
    /// Wheel delta.
    #[serde(default)]
    pub delta: Option<f64>,
}

impl MouseEvent {
    pub fn new(kind: PointerKind, x: f64, y: f64) -> Self {
        Self {
            kind,
            x,
            y,
            lat: None,
            lng: None,
            height: None,
            layer_id: None,
            delta: None,
        }
    }
}

/// Every event name an extension can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Update,
    Close,
    CameraMove,
    Select,
    Message,
    Tick,
    Resize,
    Pointer(PointerKind),
}

impl EventName {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "update" => EventName::Update,
            "close" => EventName::Close,
            "cameramove" => EventName::CameraMove,
            "select" => EventName::Select,
            "message" => EventName::Message,
            "tick" => EventName::Tick,
            "resize" => EventName::Resize,
            other => {
                let kind = PointerKind::ALL.into_iter().find(|k| k.as_str() == other)?;
                EventName::Pointer(kind)
            }
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Update => "update",
            EventName::Close => "close",
            EventName::CameraMove => "cameramove",
            EventName::Select => "select",
            EventName::Message => "message",
            EventName::Tick => "tick",
            EventName::Resize => "resize",
            EventName::Pointer(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete event delivered to one extension instance.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Update,
    Close,
    CameraMove(CameraRecord),
    Select(Option<String>),
    Message { sender: String, payload: Value },
    Tick(DateTime<Utc>),
    Resize(Viewport),
    Pointer(MouseEvent),
}

impl BridgeEvent {
    pub fn name(&self) -> EventName {
        match self {
            BridgeEvent::Update => EventName::Update,
            BridgeEvent::Close => EventName::Close,
            BridgeEvent::CameraMove(_) => EventName::CameraMove,
            BridgeEvent::Select(_) => EventName::Select,
            BridgeEvent::Message { .. } => EventName::Message,
            BridgeEvent::Tick(_) => EventName::Tick,
            BridgeEvent::Resize(_) => EventName::Resize,
            BridgeEvent::Pointer(ev) => EventName::Pointer(ev.kind),
        }
    }

    /// Handler argument, or `None` for events delivered without one.
    pub fn payload(&self) -> Option<Value> {
        match self {
            BridgeEvent::Update | BridgeEvent::Close => None,
            BridgeEvent::CameraMove(camera) => serde_json::to_value(camera).ok(),
            BridgeEvent::Select(id) => Some(id.clone().map(Value::String).unwrap_or(Value::Null)),
            BridgeEvent::Message { payload, .. } => Some(payload.clone()),
            BridgeEvent::Tick(time) => Some(json!(time.timestamp_millis())),
            BridgeEvent::Resize(viewport) => serde_json::to_value(viewport).ok(),
            BridgeEvent::Pointer(ev) => serde_json::to_value(ev).ok(),
        }
    }
}

struct Listener<H> {
    handler: H,
    once: bool,
}

/// Subscriptions of one instance, keyed by event name.
///
/// Handlers run in subscription order. Once closed, the hub drops all
/// listeners and refuses new ones, so nothing can be delivered afterwards.
pub struct EventHub<H> {
    listeners: HashMap<EventName, Vec<Listener<H>>>,
    closed: bool,
}

impl<H: Clone> EventHub<H> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            closed: false,
        }
    }

    pub fn on(&mut self, name: EventName, handler: H) {
        self.add(name, handler, false);
    }

    pub fn once(&mut self, name: EventName, handler: H) {
        self.add(name, handler, true);
    }

    fn add(&mut self, name: EventName, handler: H, once: bool) {
        if self.closed {
            return;
        }
        self.listeners
            .entry(name)
            .or_default()
            .push(Listener { handler, once });
    }

    /// Remove the handlers matching `matches`; returns how many went.
    pub fn off(&mut self, name: EventName, mut matches: impl FnMut(&H) -> bool) -> usize {
        let Some(list) = self.listeners.get_mut(&name) else {
            return 0;
        };
        let before = list.len();
        list.retain(|l| !matches(&l.handler));
        let removed = before - list.len();
        if list.is_empty() {
            self.listeners.remove(&name);
        }
        removed
    }

    /// Handlers to invoke for one emission. `once` listeners are consumed.
    pub fn take_for(&mut self, name: EventName) -> Vec<H> {
        if self.closed {
            return Vec::new();
        }
        let Some(list) = self.listeners.get_mut(&name) else {
            return Vec::new();
        };
        let handlers = list.iter().map(|l| l.handler.clone()).collect();
        list.retain(|l| !l.once);
        if list.is_empty() {
            self.listeners.remove(&name);
        }
        handlers
    }

    pub fn has_listeners(&self, name: EventName) -> bool {
        self.listeners.get(&name).is_some_and(|l| !l.is_empty())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    /// Drop every listener and refuse further subscriptions.
    pub fn close(&mut self) {
        self.listeners.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<H: Clone> Default for EventHub<H> {
    fn default() -> Self {
        Self::new()
    }
}
