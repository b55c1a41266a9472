//! Host-side collaborators and watched inputs.
//!
//! The rendering engine and the layer mutation host are external to the
//! bridge; they are consumed only through the two traits below. The headless
//! implementations in [`headless`] back the CLI and the tests.

pub mod headless;

use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::camera::{CameraDestination, CameraRecord, FlightOptions};
use crate::events::MouseEvent;
use crate::layer::{Layer, Tag};

pub use headless::{HeadlessEngine, TreeHost};

/// Camera and pointer side of the rendering engine.
pub trait RenderingEngine {
    fn name(&self) -> &str;
    fn fly_to(&mut self, destination: &CameraDestination, options: &FlightOptions);
    fn look_at(&mut self, destination: &CameraDestination, options: &FlightOptions);
    fn zoom_in(&mut self, amount: f64);
    fn zoom_out(&mut self, amount: f64);
    fn camera(&self) -> Option<CameraRecord>;
    /// Mouse events reported since the last call, oldest first.
    fn drain_mouse_events(&mut self) -> Vec<MouseEvent>;
}

/// Owner of the layer tree and the selection.
///
/// Every mutation must produce a new root `Rc`; the snapshot store rebuilds
/// only when that identity changes.
pub trait LayerHost {
    fn tree(&self) -> Rc<Layer>;
    fn selection(&self) -> Selection;
    fn select(&mut self, layer_id: Option<&str>, reason: Option<&str>);
    fn show(&mut self, ids: &[String]);
    fn hide(&mut self, ids: &[String]);
    /// Insert `layer` under `parent_id` (root when absent). Returns the new
    /// layer's id, or `None` if the parent is unknown or the id is taken.
    fn add_layer(&mut self, layer: Layer, parent_id: Option<&str>, creator: Option<&str>)
        -> Option<String>;
}

/// Current selection as seen by extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub layer_id: Option<String>,
    pub reason: Option<String>,
    pub overridden_infobox: Option<Value>,
}

/// Timeline clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    pub current_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub playing: bool,
    pub multiplier: f64,
}

impl ClockState {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            current_time: start,
            start_time: start,
            stop_time: start + Duration::days(1),
            playing: false,
            multiplier: 1.0,
        }
    }

    /// Advance by `seconds` of wall time, scaled by the multiplier and
    /// clamped to the stop time. A step too large to represent lands on the
    /// range end it points at; a NaN step leaves the clock where it is.
    pub fn advanced(&self, seconds: f64) -> Self {
        let millis = seconds * self.multiplier * 1000.0;
        if millis.is_nan() {
            return *self;
        }
        // `as` saturates at the i64 bounds.
        let next = Duration::try_milliseconds(millis.round() as i64)
            .and_then(|step| self.current_time.checked_add_signed(step))
            .unwrap_or(if millis > 0.0 {
                self.stop_time
            } else {
                self.start_time
            });
        Self {
            current_time: next.min(self.stop_time).max(self.start_time),
            ..*self
        }
    }
}

impl Default for ClockState {
    fn default() -> Self {
        Self::starting_at(DateTime::<Utc>::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub is_mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            is_mobile: false,
        }
    }
}

/// A watched input: the version only moves when the value actually changes.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    value: T,
    version: u64,
}

impl<T: PartialEq> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { value, version: 0 }
    }

    /// Store `value` if it differs from the current one. Returns whether the
    /// version moved.
    pub fn set(&mut self, value: T) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        self.version += 1;
        true
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Host-side reactive inputs the sync layer watches.
#[derive(Debug, Clone)]
pub struct HostInputs {
    pub camera: Versioned<Option<CameraRecord>>,
    pub selection: Versioned<Selection>,
    pub clock: Versioned<ClockState>,
    pub viewport: Versioned<Viewport>,
    pub tags: Versioned<Rc<Vec<Tag>>>,
    /// Scene-wide property bag exposed as `visualizer.property`.
    pub scene_property: Versioned<Value>,
}

impl HostInputs {
    pub fn new(clock: ClockState, viewport: Viewport) -> Self {
        Self {
            camera: Versioned::new(None),
            selection: Versioned::new(Selection::default()),
            clock: Versioned::new(clock),
            viewport: Versioned::new(viewport),
            tags: Versioned::new(Rc::new(Vec::new())),
            scene_property: Versioned::new(Value::Null),
        }
    }
}

impl Default for HostInputs {
    fn default() -> Self {
        Self::new(ClockState::default(), Viewport::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_ignores_equal_values() {
        let mut v = Versioned::new(Some(CameraRecord::default()));
        for _ in 0..100 {
            assert!(!v.set(Some(CameraRecord::default())));
        }
        assert_eq!(v.version(), 0);
        assert!(v.set(None));
        assert_eq!(v.version(), 1);
    }

    #[test]
    fn test_clock_clamps_to_range() {
        let clock = ClockState::default();
        let later = clock.advanced(2.0 * 86_400.0);
        assert_eq!(later.current_time, clock.stop_time);
        let earlier = clock.advanced(-10.0);
        assert_eq!(earlier.current_time, clock.start_time);
        assert_eq!(clock.advanced(1.5).current_time.timestamp_millis(), 1500);
    }

    #[test]
    fn test_clock_survives_huge_steps() {
        let clock = ClockState::default();
        assert_eq!(clock.advanced(1e14).current_time, clock.stop_time);
        assert_eq!(clock.advanced(f64::INFINITY).current_time, clock.stop_time);
        assert_eq!(clock.advanced(-1e14).current_time, clock.start_time);
        assert_eq!(clock.advanced(f64::NEG_INFINITY).current_time, clock.start_time);
        assert_eq!(clock.advanced(f64::NAN), clock);

        let fast = ClockState {
            multiplier: f64::MAX,
            ..clock
        };
        assert_eq!(fast.advanced(1.0).current_time, clock.stop_time);
        assert_eq!(fast.advanced(-1.0).current_time, clock.start_time);
    }
}
