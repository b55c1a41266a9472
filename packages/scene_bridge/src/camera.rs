//! Camera records and camera command payloads.
//!
//! The rendering engine owns the real camera; the bridge only ever sees a
//! [`CameraRecord`] copy and sends [`CameraDestination`]s back. Angles are in
//! radians, positions in degrees (lat/lng) and meters (height).

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Rough meters per degree of latitude, good enough for local orientation.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Full camera state as exposed to extensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraRecord {
    pub lat: f64,
    pub lng: f64,
    pub height: f64,
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
    /// Field of view in radians.
    pub fov: f64,
}

impl Default for CameraRecord {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lng: 0.0,
            height: 10_000_000.0,
            heading: 0.0,
            pitch: -std::f64::consts::FRAC_PI_2,
            roll: 0.0,
            fov: std::f64::consts::FRAC_PI_4,
        }
    }
}

impl CameraRecord {
    /// Orient the camera from its current position toward `target`.
    ///
    /// Works in a local east-north-up frame around the camera, so it is only
    /// accurate for targets within a few hundred kilometers.
    pub fn looking_at(&self, lat: f64, lng: f64, height: f64) -> Self {
        let cos_lat = self.lat.to_radians().cos();
        let offset = DVec3::new(
            (lng - self.lng) * METERS_PER_DEGREE * cos_lat,
            (lat - self.lat) * METERS_PER_DEGREE,
            height - self.height,
        );
        if offset.length_squared() <= f64::EPSILON {
            return *self;
        }
        let dir = offset.normalize();
        let horizontal = DVec3::new(dir.x, dir.y, 0.0).length();
        Self {
            heading: dir.x.atan2(dir.y).rem_euclid(std::f64::consts::TAU),
            pitch: dir.z.atan2(horizontal),
            ..*self
        }
    }
}

/// Partial camera target for `flyTo` / `lookAt`. Missing fields keep the
/// current camera's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDestination {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub pitch: Option<f64>,
    #[serde(default)]
    pub roll: Option<f64>,
    #[serde(default)]
    pub fov: Option<f64>,
    /// Distance kept from the target in `lookAt`.
    #[serde(default)]
    pub range: Option<f64>,
}

impl CameraDestination {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, camera: &CameraRecord) -> CameraRecord {
        CameraRecord {
            lat: self.lat.unwrap_or(camera.lat),
            lng: self.lng.unwrap_or(camera.lng),
            height: self.height.unwrap_or(camera.height),
            heading: self.heading.unwrap_or(camera.heading),
            pitch: self.pitch.unwrap_or(camera.pitch),
            roll: self.roll.unwrap_or(camera.roll),
            fov: self.fov.unwrap_or(camera.fov),
        }
    }
}

/// Animation options for camera commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightOptions {
    /// Seconds; zero or absent means jump.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub easing: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_keeps_missing_fields() {
        let camera = CameraRecord::default();
        let dest = CameraDestination {
            lat: Some(35.0),
            height: Some(500.0),
            ..Default::default()
        };
        let moved = dest.apply_to(&camera);
        assert_eq!(moved.lat, 35.0);
        assert_eq!(moved.height, 500.0);
        assert_eq!(moved.lng, camera.lng);
        assert_eq!(moved.fov, camera.fov);
    }

    #[test]
    fn test_empty_destination() {
        assert!(CameraDestination::default().is_empty());
        let dest = CameraDestination {
            range: Some(10.0),
            ..Default::default()
        };
        assert!(!dest.is_empty());
    }

    #[test]
    fn test_looking_at_north_and_below() {
        let camera = CameraRecord {
            lat: 0.0,
            lng: 0.0,
            height: 1000.0,
            ..Default::default()
        };
        let oriented = camera.looking_at(0.01, 0.0, 0.0);
        assert!(oriented.heading.abs() < 1e-9);
        assert!(oriented.pitch < 0.0);
        assert_eq!(oriented.lat, camera.lat);
    }

    #[test]
    fn test_looking_at_east() {
        let camera = CameraRecord {
            height: 0.0,
            ..Default::default()
        };
        let oriented = camera.looking_at(0.0, 0.01, 0.0);
        assert!((oriented.heading - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert!(oriented.pitch.abs() < 1e-9);
    }
}
