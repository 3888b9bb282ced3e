//! The inbound `state` message and the digestion helpers the agent uses to
//! fold feedback into mission progress.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::split_order_id;

/// State digestion failure.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid state payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Status of an action over its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Received by the robot but its trigger point was not yet reached.
    Waiting,
    /// Triggered; preparatory measures are initiated.
    Initializing,
    Running,
    /// Paused by an instant action or an external trigger.
    Paused,
    Finished,
    Failed,
}

impl ActionStatus {
    pub fn is_done(self) -> bool {
        matches!(self, ActionStatus::Finished | ActionStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    pub action_id: String,
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub action_description: String,
    #[serde(default = "default_action_status")]
    pub action_status: ActionStatus,
    #[serde(default)]
    pub result_description: String,
}

fn default_action_status() -> ActionStatus {
    ActionStatus::Waiting
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub node_id: String,
    pub sequence_id: u64,
    #[serde(default)]
    pub released: bool,
    #[serde(default)]
    pub position: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeState {
    pub edge_id: String,
    pub sequence_id: u64,
    #[serde(default)]
    pub edge_description: String,
    #[serde(default)]
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgvPosition {
    #[serde(default)]
    pub position_initialized: bool,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    #[serde(default)]
    pub map_id: String,
    #[serde(default)]
    pub deviation_range: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Velocity {
    #[serde(default)]
    pub vx: f64,
    #[serde(default)]
    pub vy: f64,
    #[serde(default)]
    pub omega: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryState {
    pub battery_charge: f64,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub battery_health: Option<i64>,
    #[serde(default)]
    pub charging: bool,
    #[serde(default)]
    pub reach: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorLevel {
    /// The AGV can continue; surfaced for visualization only.
    Warning,
    /// The AGV cannot continue; fails the affected mission node.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReference {
    pub reference_key: String,
    pub reference_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_references: Vec<ErrorReference>,
    #[serde(default)]
    pub error_description: String,
    #[serde(default = "default_error_level")]
    pub error_level: ErrorLevel,
}

fn default_error_level() -> ErrorLevel {
    ErrorLevel::Warning
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoReference {
    pub reference_key: String,
    pub reference_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub info_type: String,
    #[serde(default)]
    pub info_references: Vec<InfoReference>,
    #[serde(default)]
    pub info_description: String,
    #[serde(default)]
    pub info_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Automatic,
    Manual,
    Semiautomatic,
    Service,
    Teachin,
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::Automatic
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyState {
    #[serde(default)]
    pub e_stop: Option<String>,
    #[serde(default)]
    pub field_violation: bool,
}

/// Feedback on the current order and robot status from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub header_id: u64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_update_id: u64,
    #[serde(default)]
    pub last_node_id: String,
    #[serde(default)]
    pub last_node_sequence_id: u64,
    #[serde(default)]
    pub driving: bool,
    #[serde(default)]
    pub paused: Option<bool>,
    #[serde(default)]
    pub new_base_request: Option<bool>,
    #[serde(default)]
    pub distance_since_last_node: Option<f64>,
    #[serde(default)]
    pub operating_mode: OperatingMode,
    #[serde(default)]
    pub node_states: Vec<NodeState>,
    #[serde(default)]
    pub edge_states: Vec<EdgeState>,
    #[serde(default)]
    pub agv_position: Option<AgvPosition>,
    #[serde(default)]
    pub velocity: Option<Velocity>,
    #[serde(default)]
    pub action_states: Vec<ActionState>,
    #[serde(default)]
    pub battery_state: Option<BatteryState>,
    #[serde(default)]
    pub errors: Vec<Error>,
    #[serde(default)]
    pub information: Vec<Info>,
    #[serde(default)]
    pub safety_state: SafetyState,
    #[serde(default)]
    pub zone_set_id: Option<String>,
}

impl State {
    /// Parse a raw MQTT payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// The order-node sequence the robot will visit next, derived from the
    /// last visited node.  An empty `lastNodeId` means the robot has not yet
    /// acknowledged any node of this order.
    pub fn current_order_node_id(&self) -> u64 {
        if self.last_node_id.is_empty() {
            0
        } else {
            self.last_node_sequence_id + 2
        }
    }

    /// Whether this feedback refers to an order of the given mission.
    pub fn matches_mission(&self, mission: &str) -> bool {
        matches!(split_order_id(&self.order_id), Some((m, _)) if m == mission)
    }

    /// The first `user_info` entry, decoded as JSON.
    pub fn user_info(&self) -> Option<serde_json::Value> {
        self.information
            .iter()
            .find(|info| info.info_type == "user_info")
            .and_then(|info| serde_json::from_str(&info.info_description).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_state(order_id: &str, last_node_id: &str, last_seq: u64) -> State {
        serde_json::from_value(serde_json::json!({
            "headerId": 1,
            "timestamp": "2026-01-01T00:00:00Z",
            "orderId": order_id,
            "lastNodeId": last_node_id,
            "lastNodeSequenceId": last_seq,
        }))
        .unwrap()
    }

    #[test]
    fn parses_camel_case_payload() {
        let state = State::from_slice(
            br#"{
                "headerId": 7,
                "timestamp": "2026-01-01T00:00:00Z",
                "orderId": "survey-n0",
                "lastNodeId": "survey-n0-s2",
                "lastNodeSequenceId": 2,
                "agvPosition": {"x": 1.0, "y": 2.0, "theta": 0.5, "mapId": "warehouse"},
                "batteryState": {"batteryCharge": 80.5, "charging": false},
                "actionStates": [
                    {"actionId": "a1", "actionType": "dock_robot", "actionStatus": "RUNNING"}
                ],
                "errors": [],
                "information": [
                    {"infoType": "user_info", "infoDescription": "{\"key\": 1}", "infoLevel": "INFO"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(state.header_id, 7);
        let pos = state.agv_position.as_ref().unwrap();
        assert_eq!((pos.x, pos.y, pos.theta), (1.0, 2.0, 0.5));
        assert_eq!(pos.map_id, "warehouse");
        assert_eq!(state.battery_state.as_ref().unwrap().battery_charge, 80.5);
        assert_eq!(state.action_states[0].action_status, ActionStatus::Running);
        assert_eq!(state.user_info().unwrap()["key"], 1);
    }

    #[test]
    fn current_order_node_id_derivation() {
        assert_eq!(minimal_state("m-n0", "", 0).current_order_node_id(), 0);
        assert_eq!(
            minimal_state("m-n0", "m-n0-s2", 2).current_order_node_id(),
            4
        );
        assert_eq!(
            minimal_state("m-n0", "m-n0-s6", 6).current_order_node_id(),
            8
        );
    }

    #[test]
    fn matches_mission_checks_prefix() {
        let state = minimal_state("survey-n3", "", 0);
        assert!(state.matches_mission("survey"));
        assert!(!state.matches_mission("other"));
        // Legacy order id forms never match.
        let legacy = minimal_state("survey-s0-n0x", "", 0);
        assert!(!legacy.matches_mission("survey"));
    }

    #[test]
    fn user_info_absent_when_not_provided() {
        let state = minimal_state("m-n0", "", 0);
        assert!(state.user_info().is_none());
    }

    #[test]
    fn action_status_done() {
        assert!(ActionStatus::Finished.is_done());
        assert!(ActionStatus::Failed.is_done());
        assert!(!ActionStatus::Running.is_done());
        assert!(!ActionStatus::Waiting.is_done());
    }

    #[test]
    fn error_level_defaults_to_warning() {
        let error: Error =
            serde_json::from_str(r#"{"errorDescription": "low tire pressure"}"#).unwrap();
        assert_eq!(error.error_level, ErrorLevel::Warning);
    }
}
