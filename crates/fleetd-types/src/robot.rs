//! The persisted robot object.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{serde_secs, ObjectLifecycle, Pose2D};
use crate::error::DispatchError;

/// Operational state of a robot, as tracked by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotState {
    Idle,
    OnTask,
    Charging,
    MapDeployment,
    Teleop,
}

impl Default for RobotState {
    fn default() -> Self {
        RobotState::Idle
    }
}

impl RobotState {
    /// States in which the robot is considered busy with server-driven work.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            RobotState::OnTask | RobotState::MapDeployment | RobotState::Charging
        )
    }

    /// States from which a teleop toggle is honored.
    pub fn can_switch_teleop(self) -> bool {
        matches!(
            self,
            RobotState::Idle | RobotState::OnTask | RobotState::MapDeployment | RobotState::Teleop
        )
    }

    /// States in which a map deployment may be triggered.
    pub fn can_deploy_map(self) -> bool {
        matches!(self, RobotState::Idle | RobotState::Charging)
    }
}

/// Battery thresholds configured per robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotBatterySpec {
    /// Battery percentage below which the robot is considered critically low.
    #[serde(default = "default_critical_level")]
    pub critical_level: f64,
    /// Battery percentage at which a charging mission should be requested.
    #[serde(default)]
    pub recommended_minimum: Option<f64>,
    /// Battery percentage at which charging can stop.
    #[serde(default)]
    pub recommended_maximum: Option<f64>,
}

fn default_critical_level() -> f64 {
    10.0
}

impl Default for RobotBatterySpec {
    fn default() -> Self {
        Self {
            critical_level: default_critical_level(),
            recommended_minimum: None,
            recommended_maximum: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotSoftwareVersion {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub app: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotHardwareVersion {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
}

/// User-supplied robot configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotSpec {
    /// Labels used to identify groups of robots.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub battery: RobotBatterySpec,
    /// How long after the last message a robot is still considered online.
    #[serde(default = "default_heartbeat_timeout", with = "serde_secs")]
    pub heartbeat_timeout: Duration,
    /// Requests the robot to enter (true) or leave (false) teleop mode.
    #[serde(default)]
    pub switch_teleop: bool,
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for RobotSpec {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            battery: RobotBatterySpec::default(),
            heartbeat_timeout: default_heartbeat_timeout(),
            switch_teleop: false,
        }
    }
}

/// Server-owned robot status, updated from VDA5050 state feedback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotStatus {
    #[serde(default)]
    pub pose: Pose2D,
    #[serde(default)]
    pub software_version: RobotSoftwareVersion,
    #[serde(default)]
    pub hardware_version: RobotHardwareVersion,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub battery_level: f64,
    #[serde(default)]
    pub state: RobotState,
    /// Data collected from `user_info` entries of the mission client.
    #[serde(default)]
    pub info_messages: Option<serde_json::Value>,
    /// Key/value pairs describing problems with the robot.
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

/// Filters accepted by `Store::list` for robots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotQueryParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RobotState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
}

/// A robot as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotObject {
    pub name: String,
    #[serde(default)]
    pub lifecycle: ObjectLifecycle,
    #[serde(default)]
    pub spec: RobotSpec,
    #[serde(default)]
    pub status: RobotStatus,
}

impl RobotObject {
    pub fn new(name: impl Into<String>, spec: RobotSpec) -> Self {
        Self {
            name: name.into(),
            lifecycle: ObjectLifecycle::Alive,
            spec,
            status: RobotStatus::default(),
        }
    }

    /// Request a teleop mode change, honoring the state gating rules.
    pub fn request_teleop(&mut self, start: bool) -> Result<(), DispatchError> {
        if !self.status.state.can_switch_teleop() {
            return Err(DispatchError::Usage(format!(
                "robot {} is in {:?} and cannot switch teleop",
                self.name, self.status.state
            )));
        }
        self.spec.switch_teleop = start;
        Ok(())
    }
}
