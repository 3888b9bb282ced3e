//! Primitives shared between robot and mission objects.

use serde::{Deserialize, Serialize};

/// A pose on a 2D map, used both for robot status and for route waypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    /// The x coordinate of the pose in meters.
    #[serde(default)]
    pub x: f64,
    /// The y coordinate of the pose in meters.
    #[serde(default)]
    pub y: f64,
    /// The rotation of the pose in radians.
    #[serde(default)]
    pub theta: f64,
    /// The ID of the map this pose is associated with.
    #[serde(default)]
    pub map_id: String,
    /// Allowed coordinate deviation radius in meters.
    #[serde(default)]
    pub allowed_deviation_xy: f64,
    /// Allowed theta deviation in radians.
    #[serde(default)]
    pub allowed_deviation_theta: f64,
}

impl Default for Pose2D {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            map_id: String::new(),
            allowed_deviation_xy: 0.0,
            allowed_deviation_theta: 0.0,
        }
    }
}

impl Pose2D {
    /// Build a pose from coordinates, leaving map and deviation fields empty.
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta,
            ..Self::default()
        }
    }
}

/// Deletion lifecycle shared by all persisted objects.
///
/// `PENDING_DELETE` marks an object the user asked to delete; the component
/// owning it performs any required teardown (e.g. waiting for the robot to go
/// idle) before the store entry moves to `DELETED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectLifecycle {
    Alive,
    PendingDelete,
    Deleted,
}

impl Default for ObjectLifecycle {
    fn default() -> Self {
        ObjectLifecycle::Alive
    }
}

/// Serde adapter storing a [`std::time::Duration`] as (fractional) seconds.
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be >= 0 seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
