//! Per-instance change detection.
//!
//! Each observation compares the freshly composed common slice against the
//! last one this instance saw and yields only the events whose inputs moved.
//! Comparison is shallow: equal values produce nothing, however often the
//! host re-reports them.

use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::camera::CameraRecord;
use crate::capability::CommonSlice;
use crate::events::{BridgeEvent, MouseEvent};
use crate::host::Viewport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Active,
    TornDown,
}

/// The fields an instance last observed.
#[derive(Debug, Clone, PartialEq)]
struct Observed {
    selected: Option<String>,
    camera: Option<CameraRecord>,
    time: DateTime<Utc>,
    viewport: Viewport,
}

impl Observed {
    fn of(common: &CommonSlice) -> Self {
        Self {
            selected: common.layers.selection.layer_id.clone(),
            camera: common.visualizer.camera,
            time: common.clock.current_time,
            viewport: common.viewport,
        }
    }
}

pub struct InstanceSync {
    state: SyncState,
    last: Option<(Rc<CommonSlice>, Observed)>,
}

impl InstanceSync {
    pub fn new() -> Self {
        Self {
            state: SyncState::Uninitialized,
            last: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Start observing from `common`; nothing fires for the initial values.
    pub fn activate(&mut self, common: &Rc<CommonSlice>) {
        if self.state != SyncState::Uninitialized {
            return;
        }
        self.state = SyncState::Active;
        self.last = Some((Rc::clone(common), Observed::of(common)));
    }

    /// Events caused by moving from the last observed slice to `common`, in
    /// delivery order: select, cameramove, tick, resize, then one update.
    pub fn observe(&mut self, common: &Rc<CommonSlice>) -> Vec<BridgeEvent> {
        if self.state != SyncState::Active {
            return Vec::new();
        }
        let next = Observed::of(common);
        let Some((prev_common, prev)) = self.last.as_ref() else {
            self.last = Some((Rc::clone(common), next));
            return Vec::new();
        };
        if Rc::ptr_eq(prev_common, common) {
            return Vec::new();
        }

        let mut events = Vec::new();
        if next.selected != prev.selected {
            events.push(BridgeEvent::Select(next.selected.clone()));
        }
        if next.camera != prev.camera {
            if let Some(camera) = next.camera {
                events.push(BridgeEvent::CameraMove(camera));
            }
        }
        if next.time != prev.time {
            events.push(BridgeEvent::Tick(next.time));
        }
        if next.viewport != prev.viewport {
            events.push(BridgeEvent::Resize(next.viewport));
        }
        events.push(BridgeEvent::Update);

        self.last = Some((Rc::clone(common), next));
        events
    }

    /// Pointer events pass straight through while active.
    pub fn forward_pointer(&self, event: &MouseEvent) -> Option<BridgeEvent> {
        (self.state == SyncState::Active).then(|| BridgeEvent::Pointer(event.clone()))
    }

    /// Leave the active state. Returns the `close` event to deliver before
    /// subscriptions are dropped, or `None` if already torn down.
    pub fn teardown(&mut self) -> Option<BridgeEvent> {
        let was_active = self.state == SyncState::Active;
        self.state = SyncState::TornDown;
        self.last = None;
        was_active.then_some(BridgeEvent::Close)
    }
}

impl Default for InstanceSync {
    fn default() -> Self {
        Self::new()
    }
}
