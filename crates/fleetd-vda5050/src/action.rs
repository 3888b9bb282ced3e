//! VDA5050 actions and instant-action messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::PROTOCOL_VERSION;

/// How an action interacts with driving and other actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingType {
    /// Allows driving and other actions.
    None,
    /// Allows other actions, but not driving.
    Soft,
    /// The only allowed action at that time.
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub key: String,
    pub value: String,
}

/// An action sent from the server to the robot, either attached to an order
/// node or as an instant action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: String,
    pub action_id: String,
    #[serde(default = "default_blocking")]
    pub blocking_type: BlockingType,
    #[serde(default)]
    pub action_parameters: Vec<ActionParameter>,
    #[serde(default)]
    pub action_description: String,
}

fn default_blocking() -> BlockingType {
    BlockingType::Hard
}

impl Action {
    /// Build the order action for an `action` mission leaf.  The action id is
    /// derived from the carrying node id and the mission-tree index so that
    /// error references can be mapped back to the leaf.
    pub fn from_mission_action(
        action_type: &str,
        parameters: &BTreeMap<String, serde_json::Value>,
        node_id: &str,
        mission_node_index: usize,
    ) -> Self {
        Self {
            action_type: action_type.to_string(),
            action_id: format!("{node_id}-n{mission_node_index}"),
            blocking_type: default_blocking(),
            action_parameters: parameters
                .iter()
                .map(|(key, value)| ActionParameter {
                    key: key.clone(),
                    value: match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                })
                .collect(),
            action_description: String::new(),
        }
    }

    /// Build an instant action with the id convention
    /// `"{mission}-instantaction-n{header}"`.
    pub fn instant(kind: InstantActionKind, mission: &str, header_id: u64) -> Self {
        Self {
            action_type: kind.as_str().to_string(),
            action_id: format!("{mission}-instantaction-n{header_id}"),
            blocking_type: default_blocking(),
            action_parameters: Vec::new(),
            action_description: String::new(),
        }
    }
}

/// The instant actions the dispatcher can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantActionKind {
    CancelOrder,
    FactsheetRequest,
    StartTeleop,
    StopTeleop,
}

impl InstantActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstantActionKind::CancelOrder => "cancelOrder",
            InstantActionKind::FactsheetRequest => "factsheetRequest",
            InstantActionKind::StartTeleop => "startTeleop",
            InstantActionKind::StopTeleop => "stopTeleop",
        }
    }

    pub fn from_action_type(action_type: &str) -> Option<Self> {
        match action_type {
            "cancelOrder" => Some(InstantActionKind::CancelOrder),
            "factsheetRequest" => Some(InstantActionKind::FactsheetRequest),
            "startTeleop" => Some(InstantActionKind::StartTeleop),
            "stopTeleop" => Some(InstantActionKind::StopTeleop),
            _ => None,
        }
    }
}

/// Vendor-specific action types carried in the `actionType` field.
pub struct VendorActionType;

impl VendorActionType {
    pub const DUMMY_ACTION: &'static str = "dummy_action";
    pub const LOAD_MAP: &'static str = "load_map";
    pub const PAUSE_ORDER: &'static str = "pause_order";
    pub const DOCK_ROBOT: &'static str = "dock_robot";
    pub const GET_OBJECTS: &'static str = "get_objects";
}

/// The `instantActions` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantActions {
    pub header_id: u64,
    pub timestamp: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
    pub instant_actions: Vec<Action>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl InstantActions {
    pub fn single(header_id: u64, timestamp: String, action: Action) -> Self {
        Self {
            header_id,
            timestamp,
            version: default_version(),
            manufacturer: String::new(),
            serial_number: String::new(),
            instant_actions: vec![action],
        }
    }
}
