//! The outbound `order` message and its assembly from mission-tree leaves.

use serde::{Deserialize, Serialize};

use fleetd_types::mission::{ActionNode, MoveNode, RouteNode};
use fleetd_types::{Pose2D, RobotObject};
use thiserror::Error;

use crate::action::Action;
use crate::PROTOCOL_VERSION;

/// Order assembly failure.
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("order must contain at least one node")]
    NoNodes,
    #[error("order has {nodes} nodes and {edges} edges; edges must be nodes - 1")]
    EdgeCount { nodes: usize, edges: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default)]
    pub map_id: String,
    #[serde(default)]
    pub map_description: String,
    #[serde(default)]
    pub allowed_deviation_x_y: f64,
    #[serde(default)]
    pub allowed_deviation_theta: f64,
}

impl NodePosition {
    fn from_pose(pose: &Pose2D) -> Self {
        Self {
            x: pose.x,
            y: pose.y,
            theta: pose.theta,
            map_id: pose.map_id.clone(),
            map_description: String::new(),
            allowed_deviation_x_y: pose.allowed_deviation_xy,
            allowed_deviation_theta: pose.allowed_deviation_theta,
        }
    }
}

/// A node (goal) the robot travels to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub sequence_id: u64,
    #[serde(default = "default_released")]
    pub released: bool,
    #[serde(default)]
    pub node_position: Option<NodePosition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub node_description: String,
}

fn default_released() -> bool {
    true
}

impl Node {
    fn new(mission: &str, mission_node_index: usize, sequence: u64, position: NodePosition) -> Self {
        Self {
            node_id: format!("{mission}-n{mission_node_index}-s{sequence}"),
            sequence_id: sequence,
            released: true,
            node_position: Some(position),
            actions: Vec::new(),
            node_description: String::new(),
        }
    }

    /// The seed node at sequence 0: the robot's currently acknowledged pose,
    /// anchoring every order.
    pub fn seed(robot: &RobotObject, mission: &str, mission_node_index: usize) -> Self {
        Self::new(
            mission,
            mission_node_index,
            0,
            NodePosition::from_pose(&robot.status.pose),
        )
    }

    /// A waypoint node at an even sequence (2, 4, 6, …).
    pub fn from_waypoint(
        pose: &Pose2D,
        mission: &str,
        mission_node_index: usize,
        sequence: u64,
    ) -> Self {
        Self::new(
            mission,
            mission_node_index,
            sequence,
            NodePosition::from_pose(pose),
        )
    }

    /// The computed target of a `move` leaf: a relative translation along the
    /// current heading, or a relative rotation in place.
    pub fn from_move(
        robot: &RobotObject,
        movement: &MoveNode,
        mission: &str,
        mission_node_index: usize,
        sequence: u64,
    ) -> Self {
        let pose = &robot.status.pose;
        let (x, y, theta) = match movement {
            MoveNode::Distance { distance } => (
                pose.x + distance * pose.theta.cos(),
                pose.y + distance * pose.theta.sin(),
                pose.theta,
            ),
            MoveNode::Rotation { rotation } => (pose.x, pose.y, pose.theta + rotation),
        };
        let mut target = Pose2D::new(x, y, theta);
        target.map_id = pose.map_id.clone();
        Self::new(
            mission,
            mission_node_index,
            sequence,
            NodePosition::from_pose(&target),
        )
    }
}

/// An edge (transition) between two order nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub sequence_id: u64,
    #[serde(default)]
    pub edge_description: String,
    #[serde(default = "default_released")]
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Edge {
    /// Edge `k` (odd sequence) connects the nodes at sequences `k-1` and
    /// `k+1`.
    pub fn link(mission: &str, mission_node_index: usize, sequence: u64) -> Self {
        Self {
            edge_id: format!("{mission}-e{sequence}"),
            sequence_id: sequence,
            edge_description: String::new(),
            released: true,
            start_node_id: format!("{mission}-n{mission_node_index}-s{}", sequence - 1),
            end_node_id: format!("{mission}-n{mission_node_index}-s{}", sequence + 1),
            actions: Vec::new(),
        }
    }
}

/// The `order` message sent from the dispatcher to a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(default)]
    pub header_id: u64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
    pub order_id: String,
    pub order_update_id: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Order {
    fn assemble(
        mission: &str,
        mission_node_index: usize,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> Result<Self, OrderError> {
        if nodes.is_empty() {
            return Err(OrderError::NoNodes);
        }
        if edges.len() != nodes.len() - 1 {
            return Err(OrderError::EdgeCount {
                nodes: nodes.len(),
                edges: edges.len(),
            });
        }
        Ok(Self {
            header_id: 0,
            timestamp: String::new(),
            version: default_version(),
            manufacturer: String::new(),
            serial_number: String::new(),
            order_id: format!("{mission}-n{mission_node_index}"),
            order_update_id: 0,
            nodes,
            edges,
        })
    }

    /// Order for a `route` leaf: seed node plus one node per waypoint at
    /// sequences 2, 4, 6, … and one edge per gap at 1, 3, 5, …
    pub fn from_route(
        route: &RouteNode,
        robot: &RobotObject,
        mission: &str,
        mission_node_index: usize,
    ) -> Result<Self, OrderError> {
        let mut nodes = vec![Node::seed(robot, mission, mission_node_index)];
        let mut edges = Vec::with_capacity(route.size());
        for (j, pose) in route.waypoints.iter().enumerate() {
            nodes.push(Node::from_waypoint(
                pose,
                mission,
                mission_node_index,
                (j as u64) * 2 + 2,
            ));
            edges.push(Edge::link(mission, mission_node_index, (j as u64) * 2 + 1));
        }
        Self::assemble(mission, mission_node_index, nodes, edges)
    }

    /// Order for a `move` leaf: seed node, one computed target at sequence 2,
    /// one edge at sequence 1.
    pub fn from_move(
        movement: &MoveNode,
        robot: &RobotObject,
        mission: &str,
        mission_node_index: usize,
    ) -> Result<Self, OrderError> {
        let nodes = vec![
            Node::seed(robot, mission, mission_node_index),
            Node::from_move(robot, movement, mission, mission_node_index, 2),
        ];
        let edges = vec![Edge::link(mission, mission_node_index, 1)];
        Self::assemble(mission, mission_node_index, nodes, edges)
    }

    /// Order for an `action` leaf: only the seed node, with the action
    /// attached; no edges.
    pub fn from_action(
        action: &ActionNode,
        robot: &RobotObject,
        mission: &str,
        mission_node_index: usize,
    ) -> Result<Self, OrderError> {
        let mut seed = Node::seed(robot, mission, mission_node_index);
        let node_id = seed.node_id.clone();
        seed.actions.push(Action::from_mission_action(
            &action.action_type,
            &action.action_parameters,
            &node_id,
            mission_node_index,
        ));
        Self::assemble(mission, mission_node_index, vec![seed], vec![])
    }
}
