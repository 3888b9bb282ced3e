//! The persisted mission object and its behavior-tree node alphabet.
//!
//! A mission is a flat, topologically ordered list of [`MissionNode`]s; each
//! node names a parent that must appear earlier in the list, which makes
//! cycles impossible by construction.  The implicit root is a sequence named
//! `"root"`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{serde_secs, ObjectLifecycle, Pose2D};
use crate::error::DispatchError;

/// Name of the implicit root sequence. Reserved; user nodes cannot use it.
pub const ROOT_NODE: &str = "root";

/// Completion state of a mission or of a single mission-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    /// Not yet started.
    Pending,
    /// Accepted and started by the robot.
    Running,
    /// Completed successfully.
    Completed,
    /// Canceled by the user.
    Canceled,
    /// Could not be completed.
    Failed,
}

impl Default for MissionState {
    fn default() -> Self {
        MissionState::Pending
    }
}

impl MissionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionState::Completed | MissionState::Canceled | MissionState::Failed
        )
    }
}

/// Why a mission ended up `FAILED` (or `CANCELED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionFailureCategory {
    /// The robot reported the failure.
    RobotApp,
    /// The mission ran longer than its allowed timeout.
    Timeout,
    /// The mission could not complete before its absolute deadline.
    Deadline,
    /// The mission was canceled by a user.
    Canceled,
}

/// A list of waypoints for the robot to traverse in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteNode {
    pub waypoints: Vec<Pose2D>,
}

impl RouteNode {
    pub fn size(&self) -> usize {
        self.waypoints.len()
    }
}

/// A single relative translation or rotation from the current pose.
///
/// Exactly one of the two is representable, so invariant checking lives in
/// the type rather than a validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MoveNode {
    Distance {
        /// Translation along the current heading, in meters.
        distance: f64,
    },
    Rotation {
        /// Relative rotation, in radians.
        rotation: f64,
    },
}

/// A vendor-specific action dispatched to the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Describes an action that the robot can perform.
    pub action_type: String,
    /// Parameters for the specified action.
    #[serde(default)]
    pub action_parameters: BTreeMap<String, serde_json::Value>,
}

/// A server-side HTTP POST; no robot interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyNode {
    /// API endpoint to be called.
    pub url: String,
    /// JSON payload sent in the request body.
    #[serde(default)]
    pub json_data: serde_json::Value,
    /// Timeout for the API call.
    #[serde(default = "default_notify_timeout", with = "serde_secs")]
    pub timeout: Duration,
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Resolves immediately to SUCCESS or FAILURE when started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantNode {
    /// The state the node resolves to upon activation.
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

/// The seven node kinds. Serialized as a single-key object
/// (`{"route": {...}}`, `{"sequence": {}}`, ...), so "exactly one kind"
/// holds by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionNodeKind {
    Route(RouteNode),
    Move(MoveNode),
    Action(ActionNode),
    Notify(NotifyNode),
    /// Starts its first child; on child FAILURE starts the next. Returns
    /// SUCCESS on the first child success, FAILURE if all children fail.
    Selector {},
    /// Starts its first child; on child SUCCESS starts the next. Returns
    /// FAILURE on the first child failure, SUCCESS if all children succeed.
    Sequence {},
    Constant(ConstantNode),
}

impl MissionNodeKind {
    /// Whether this kind is a control node (has children) rather than a leaf.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MissionNodeKind::Selector {} | MissionNodeKind::Sequence {}
        )
    }
}

/// One node of the mission tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionNode {
    /// Unique name within the mission; defaults to the node's list index.
    #[serde(default)]
    pub name: Option<String>,
    /// The parent node; must appear earlier in the list.
    #[serde(default = "default_parent")]
    pub parent: String,
    #[serde(flatten)]
    pub kind: MissionNodeKind,
}

fn default_parent() -> String {
    ROOT_NODE.to_string()
}

impl MissionNode {
    pub fn new(kind: MissionNodeKind) -> Self {
        Self {
            name: None,
            parent: default_parent(),
            kind,
        }
    }

    pub fn named(name: impl Into<String>, kind: MissionNodeKind) -> Self {
        Self {
            name: Some(name.into()),
            parent: default_parent(),
            kind,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = parent.into();
        self
    }

    /// The node's name. Only valid after [`MissionSpec::validate`] has
    /// assigned defaults.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// User-supplied mission definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    /// The name of the robot this mission is assigned to.
    pub robot: String,
    /// The nodes (tasks) for the robot to complete, in topological order.
    pub mission_tree: Vec<MissionNode>,
    /// How long the mission is allowed to run before giving up.
    #[serde(default = "default_mission_timeout", with = "serde_secs")]
    pub timeout: Duration,
    /// When the mission must complete by before it is failed.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Marker for whether the mission is requested to be canceled.
    #[serde(default)]
    pub needs_canceled: bool,
    /// Route nodes to be rewritten, keyed by node name.
    #[serde(default)]
    pub update_nodes: Option<BTreeMap<String, RouteNode>>,
}

fn default_mission_timeout() -> Duration {
    Duration::from_secs(300)
}

impl MissionSpec {
    pub fn new(robot: impl Into<String>, mission_tree: Vec<MissionNode>) -> Self {
        Self {
            robot: robot.into(),
            mission_tree,
            timeout: default_mission_timeout(),
            deadline: None,
            needs_canceled: false,
            update_nodes: None,
        }
    }

    /// Enforce the mission-tree invariants, assigning default names along the
    /// way: the tree is non-empty, names are unique and do not shadow
    /// `"root"`, every parent appears earlier in the list and is a control
    /// node, and route nodes carry at least one waypoint.
    pub fn validate(&mut self) -> Result<(), DispatchError> {
        if self.mission_tree.is_empty() {
            return Err(DispatchError::Usage(
                "number of mission nodes must be >= 1".into(),
            ));
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        seen.insert(ROOT_NODE.to_string());
        let mut controls: BTreeSet<String> = seen.clone();

        for (i, node) in self.mission_tree.iter_mut().enumerate() {
            if node.name.is_none() {
                node.name = Some(i.to_string());
            }
            let name = node.name().to_string();
            if seen.contains(&name) {
                return Err(DispatchError::Usage(format!(
                    "mission node name {name} is repeated; all node names must be unique"
                )));
            }
            if !seen.contains(&node.parent) {
                return Err(DispatchError::Usage(format!(
                    "mission node \"{name}\" has parent \"{}\" which does not appear before it",
                    node.parent
                )));
            }
            if !controls.contains(&node.parent) {
                return Err(DispatchError::Usage(format!(
                    "mission node \"{name}\" has leaf parent \"{}\"; parents must be \
                     sequence or selector nodes",
                    node.parent
                )));
            }
            if let MissionNodeKind::Route(route) = &node.kind {
                if route.waypoints.is_empty() {
                    return Err(DispatchError::Usage(format!(
                        "route node \"{name}\" must have at least one waypoint"
                    )));
                }
            }
            if node.kind.is_control() {
                controls.insert(name.clone());
            }
            seen.insert(name);
        }
        Ok(())
    }
}

/// The status of a single node in the mission tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionNodeStatus {
    #[serde(default)]
    pub state: MissionState,
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// Server-owned mission progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionStatus {
    /// The completion status of the mission.
    #[serde(default)]
    pub state: MissionState,
    /// Index of the mission-tree node the robot is currently working on.
    #[serde(default)]
    pub current_node: usize,
    /// State and optional message of every tree node, including `"root"`.
    #[serde(default)]
    pub node_status: BTreeMap<String, MissionNodeStatus>,
    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,
    /// Human-readable reason when the mission moved to FAILED.
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_category: Option<MissionFailureCategory>,
}

impl MissionStatus {
    pub fn node_state(&self, name: &str) -> MissionState {
        self.node_status
            .get(name)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn set_node_state(&mut self, name: &str, state: MissionState) {
        self.node_status.entry(name.to_string()).or_default().state = state;
    }
}

/// Filters accepted by `Store::list` for missions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionQueryParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<MissionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_before: Option<DateTime<Utc>>,
    /// Keep only the N most recently started missions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_recent: Option<usize>,
}

/// A mission as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionObject {
    pub name: String,
    #[serde(default)]
    pub lifecycle: ObjectLifecycle,
    pub spec: MissionSpec,
    #[serde(default)]
    pub status: MissionStatus,
}

impl MissionObject {
    /// Validate the spec and seed `node_status` for the root and every node.
    pub fn new(name: impl Into<String>, mut spec: MissionSpec) -> Result<Self, DispatchError> {
        spec.validate()?;
        let mut status = MissionStatus::default();
        status
            .node_status
            .insert(ROOT_NODE.to_string(), MissionNodeStatus::default());
        for node in &spec.mission_tree {
            status
                .node_status
                .insert(node.name().to_string(), MissionNodeStatus::default());
        }
        Ok(Self {
            name: name.into(),
            lifecycle: ObjectLifecycle::Alive,
            spec,
            status,
        })
    }

    /// Look up a mission-tree node index by name.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.spec.mission_tree.iter().position(|n| n.name() == name)
    }

    /// Mark the mission to be canceled.  Terminal missions cannot be
    /// canceled; canceling twice is reported distinctly.
    pub fn cancel(&mut self) -> Result<(), DispatchError> {
        if self.status.state.is_terminal() {
            if self.status.state == MissionState::Canceled {
                return Err(DispatchError::Usage(format!(
                    "mission {} is already canceled",
                    self.name
                )));
            }
            return Err(DispatchError::Usage(format!(
                "completed mission {} cannot be canceled",
                self.name
            )));
        }
        self.spec.needs_canceled = true;
        Ok(())
    }

    /// Request a rewrite of the named route nodes.  Only valid while the
    /// mission is PENDING or RUNNING and the target nodes are not finished.
    pub fn update(
        &mut self,
        update_nodes: BTreeMap<String, RouteNode>,
    ) -> Result<(), DispatchError> {
        if self.status.state.is_terminal() {
            return Err(DispatchError::Usage(format!(
                "mission {} is finished with status {:?}",
                self.name, self.status.state
            )));
        }
        for name in update_nodes.keys() {
            let Some(idx) = self.node_index(name) else {
                return Err(DispatchError::Usage(format!(
                    "node {name} does not exist in mission {}",
                    self.name
                )));
            };
            if !matches!(
                self.spec.mission_tree[idx].kind,
                MissionNodeKind::Route(_)
            ) {
                return Err(DispatchError::Usage(format!(
                    "node {name} is not a route node and cannot be updated"
                )));
            }
            if self.status.node_state(name).is_terminal() {
                return Err(DispatchError::Usage(format!(
                    "mission node {name} is finished with status {:?}",
                    self.status.node_state(name)
                )));
            }
        }
        self.spec.update_nodes = Some(update_nodes);
        Ok(())
    }
}
