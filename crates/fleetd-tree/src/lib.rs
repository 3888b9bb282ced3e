//! Behavior-tree interpreter for mission trees.
//!
//! The tree holds only structure (child index lists built from the mission's
//! topological node list); all node state lives in the mission's
//! `node_status` map, which the owning agent persists through the store.
//! Each [`MissionBehaviorTree::tick`] folds leaf states upward through the
//! control nodes and reports the *tip*, the deepest currently-running leaf,
//! which is the leaf the agent issues orders for.
//!
//! # Composites
//!
//! | Node type  | Fold                                                         |
//! |------------|--------------------------------------------------------------|
//! | `sequence` | children left-to-right; first FAILURE wins, all SUCCESS wins |
//! | `selector` | children left-to-right; first SUCCESS wins, all FAILURE wins |
//!
//! The implicit root is a sequence named `"root"`.

use thiserror::Error;

use fleetd_types::mission::{
    MissionNodeKind, MissionObject, MissionState, MissionStatus, ROOT_NODE,
};

/// Tree construction failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("given parent {parent} does not exist")]
    MissingParent { parent: String },
}

/// The execution status of a behavior tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStatus {
    /// The node has not been visited yet.
    Invalid,
    /// The node has started but has not yet finished.
    Running,
    /// The node completed its task.
    Success,
    /// The node failed.
    Failure,
}

/// Map a tree status onto the persisted mission state.
pub fn tree_to_mission_state(status: TreeStatus) -> MissionState {
    match status {
        TreeStatus::Success => MissionState::Completed,
        TreeStatus::Failure => MissionState::Failed,
        TreeStatus::Running => MissionState::Running,
        TreeStatus::Invalid => MissionState::Pending,
    }
}

/// Map a persisted mission state onto a tree status.
pub fn mission_to_tree_state(state: MissionState) -> TreeStatus {
    match state {
        MissionState::Completed => TreeStatus::Success,
        MissionState::Running => TreeStatus::Running,
        MissionState::Pending => TreeStatus::Invalid,
        MissionState::Canceled | MissionState::Failed => TreeStatus::Failure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeShape {
    Sequence,
    Selector,
    /// Resolves to the given status the moment it is reached.
    Constant(bool),
    /// route / move / action / notify: state driven by feedback through
    /// `node_status`.
    Leaf,
}

#[derive(Debug)]
struct TreeNode {
    /// Index into the mission tree; `None` for the implicit root.
    mission_index: Option<usize>,
    name: String,
    shape: NodeShape,
    children: Vec<usize>,
}

/// The leaf the agent should currently be executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tip {
    /// Index into `mission_tree`.
    pub index: usize,
    pub name: String,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Folded status of the root.
    pub root: TreeStatus,
    /// Deepest running leaf, or `None` when the tree is terminal.
    pub tip: Option<Tip>,
}

/// A behavior tree built from a mission's topological node list.
#[derive(Debug)]
pub struct MissionBehaviorTree {
    nodes: Vec<TreeNode>,
}

impl MissionBehaviorTree {
    /// Build the tree, attaching each mission node under its named parent.
    ///
    /// The mission must already be validated; an unknown parent still fails
    /// cleanly so a corrupt stored mission turns into a mission FAILURE
    /// rather than a panic.
    pub fn build(mission: &MissionObject) -> Result<Self, TreeError> {
        let mut nodes = vec![TreeNode {
            mission_index: None,
            name: ROOT_NODE.to_string(),
            shape: NodeShape::Sequence,
            children: Vec::new(),
        }];

        for (i, mission_node) in mission.spec.mission_tree.iter().enumerate() {
            let shape = match &mission_node.kind {
                MissionNodeKind::Sequence {} => NodeShape::Sequence,
                MissionNodeKind::Selector {} => NodeShape::Selector,
                MissionNodeKind::Constant(constant) => NodeShape::Constant(constant.success),
                MissionNodeKind::Route(_)
                | MissionNodeKind::Move(_)
                | MissionNodeKind::Action(_)
                | MissionNodeKind::Notify(_) => NodeShape::Leaf,
            };
            let parent = nodes
                .iter()
                .position(|n| n.name == mission_node.parent)
                .ok_or_else(|| TreeError::MissingParent {
                    parent: mission_node.parent.clone(),
                })?;
            let index = nodes.len();
            nodes.push(TreeNode {
                mission_index: Some(i),
                name: mission_node.name().to_string(),
                shape,
                children: Vec::new(),
            });
            nodes[parent].children.push(index);
        }

        Ok(Self { nodes })
    }

    /// Evaluate the tree against the given status, write the folded state of
    /// every control and constant node (and the root) back into
    /// `node_status`, and return the root status together with the tip.
    pub fn tick(&self, status: &mut MissionStatus) -> TickOutcome {
        let (root, tip) = self.eval(0, status);
        // Control/constant nodes and the root mirror their folded state;
        // leaves keep the state written from robot feedback.
        let folded: Vec<Option<(String, TreeStatus)>> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                (!matches!(node.shape, NodeShape::Leaf))
                    .then(|| (node.name.clone(), self.eval(i, status).0))
            })
            .collect();
        for (name, state) in folded.into_iter().flatten() {
            status.set_node_state(&name, tree_to_mission_state(state));
        }
        if let Some(tip) = &tip {
            status.current_node = tip.index;
        }
        TickOutcome { root, tip }
    }

    fn eval(&self, index: usize, status: &MissionStatus) -> (TreeStatus, Option<Tip>) {
        let node = &self.nodes[index];
        match node.shape {
            NodeShape::Constant(success) => (
                if success {
                    TreeStatus::Success
                } else {
                    TreeStatus::Failure
                },
                None,
            ),
            NodeShape::Leaf => {
                let state = status.node_state(&node.name);
                // A PENDING leaf that is being queried counts as RUNNING so
                // the tree does not collapse before the first feedback.
                let tree_state = match mission_to_tree_state(state) {
                    TreeStatus::Invalid => TreeStatus::Running,
                    other => other,
                };
                let tip = (tree_state == TreeStatus::Running).then(|| Tip {
                    index: node.mission_index.unwrap_or(0),
                    name: node.name.clone(),
                });
                (tree_state, tip)
            }
            NodeShape::Sequence => {
                for &child in &node.children {
                    match self.eval(child, status) {
                        (TreeStatus::Success, _) => continue,
                        other => return other,
                    }
                }
                (TreeStatus::Success, None)
            }
            NodeShape::Selector => {
                for &child in &node.children {
                    match self.eval(child, status) {
                        (TreeStatus::Failure, _) => continue,
                        other => return other,
                    }
                }
                (TreeStatus::Failure, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_types::mission::{
        ActionNode, ConstantNode, MissionNode, MissionSpec, RouteNode,
    };
    use fleetd_types::Pose2D;
    use std::collections::BTreeMap;

    fn route_kind(x: f64, y: f64) -> MissionNodeKind {
        MissionNodeKind::Route(RouteNode {
            waypoints: vec![Pose2D::new(x, y, 0.0)],
        })
    }

    fn action_kind(action_type: &str) -> MissionNodeKind {
        MissionNodeKind::Action(ActionNode {
            action_type: action_type.to_string(),
            action_parameters: BTreeMap::new(),
        })
    }

    fn mission(nodes: Vec<MissionNode>) -> MissionObject {
        MissionObject::new("m1", MissionSpec::new("carter01", nodes)).unwrap()
    }

    #[test]
    fn build_fails_on_missing_parent() {
        // Bypass spec validation to simulate a corrupt stored mission.
        let mut m = mission(vec![MissionNode::named("a", route_kind(1.0, 1.0))]);
        m.spec.mission_tree[0].parent = "ghost".to_string();
        let err = MissionBehaviorTree::build(&m).unwrap_err();
        assert_eq!(
            err,
            TreeError::MissingParent {
                parent: "ghost".to_string()
            }
        );
    }

    #[test]
    fn first_tick_yields_first_leaf_as_tip() {
        let m = mission(vec![
            MissionNode::named("go", route_kind(1.0, 1.0)),
            MissionNode::named("dock", action_kind("dock_robot")),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Running);
        assert_eq!(outcome.tip.unwrap().name, "go");
        assert_eq!(status.node_state(ROOT_NODE), MissionState::Running);
    }

    #[test]
    fn sequence_advances_after_leaf_completes() {
        let m = mission(vec![
            MissionNode::named("go", route_kind(1.0, 1.0)),
            MissionNode::named("dock", action_kind("dock_robot")),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        status.set_node_state("go", MissionState::Completed);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Running);
        let tip = outcome.tip.unwrap();
        assert_eq!(tip.name, "dock");
        assert_eq!(tip.index, 1);
        assert_eq!(status.current_node, 1);
    }

    #[test]
    fn sequence_fails_on_first_failure() {
        let m = mission(vec![
            MissionNode::named("go", route_kind(1.0, 1.0)),
            MissionNode::named("dock", action_kind("dock_robot")),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        status.set_node_state("go", MissionState::Failed);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Failure);
        assert!(outcome.tip.is_none());
        assert_eq!(status.node_state(ROOT_NODE), MissionState::Failed);
    }

    #[test]
    fn all_leaves_complete_means_success() {
        let m = mission(vec![
            MissionNode::named("go", route_kind(1.0, 1.0)),
            MissionNode::named("dock", action_kind("dock_robot")),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        status.set_node_state("go", MissionState::Completed);
        status.set_node_state("dock", MissionState::Completed);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Success);
        assert!(outcome.tip.is_none());
        assert_eq!(status.node_state(ROOT_NODE), MissionState::Completed);
    }

    #[test]
    fn selector_recovers_from_failed_branch() {
        // route -> selector { action(fails), sequence { route, action } }
        let m = mission(vec![
            MissionNode::named("approach", route_kind(1.0, 1.0)),
            MissionNode::named("try", MissionNodeKind::Selector {}),
            MissionNode::named("quick_dock", action_kind("dock_robot")).with_parent("try"),
            MissionNode::named("fallback", MissionNodeKind::Sequence {}).with_parent("try"),
            MissionNode::named("reposition", route_kind(2.0, 2.0)).with_parent("fallback"),
            MissionNode::named("slow_dock", action_kind("dock_robot")).with_parent("fallback"),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();

        status.set_node_state("approach", MissionState::Completed);
        status.set_node_state("quick_dock", MissionState::Failed);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Running);
        assert_eq!(outcome.tip.unwrap().name, "reposition");
        assert_eq!(status.node_state("try"), MissionState::Running);

        status.set_node_state("reposition", MissionState::Completed);
        status.set_node_state("slow_dock", MissionState::Completed);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Success);
        assert_eq!(status.node_state("try"), MissionState::Completed);
        assert_eq!(status.node_state("fallback"), MissionState::Completed);
        assert_eq!(status.node_state("quick_dock"), MissionState::Failed);
    }

    #[test]
    fn selector_fails_when_all_children_fail() {
        let m = mission(vec![
            MissionNode::named("try", MissionNodeKind::Selector {}),
            MissionNode::named("a", action_kind("dock_robot")).with_parent("try"),
            MissionNode::named("b", action_kind("dock_robot")).with_parent("try"),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        status.set_node_state("a", MissionState::Failed);
        status.set_node_state("b", MissionState::Failed);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Failure);
        assert_eq!(status.node_state("try"), MissionState::Failed);
    }

    #[test]
    fn constant_nodes_resolve_immediately() {
        let m = mission(vec![
            MissionNode::named("try", MissionNodeKind::Selector {}),
            MissionNode::named("never", MissionNodeKind::Constant(ConstantNode {
                success: false,
            }))
            .with_parent("try"),
            MissionNode::named("always", MissionNodeKind::Constant(ConstantNode {
                success: true,
            }))
            .with_parent("try"),
        ]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Success);
        assert!(outcome.tip.is_none());
        assert_eq!(status.node_state("never"), MissionState::Failed);
        assert_eq!(status.node_state("always"), MissionState::Completed);
    }

    #[test]
    fn canceled_leaf_folds_as_failure() {
        let m = mission(vec![MissionNode::named("go", route_kind(1.0, 1.0))]);
        let tree = MissionBehaviorTree::build(&m).unwrap();
        let mut status = m.status.clone();
        status.set_node_state("go", MissionState::Canceled);
        let outcome = tree.tick(&mut status);
        assert_eq!(outcome.root, TreeStatus::Failure);
    }

    #[test]
    fn state_mappings_roundtrip() {
        assert_eq!(
            tree_to_mission_state(TreeStatus::Success),
            MissionState::Completed
        );
        assert_eq!(
            tree_to_mission_state(TreeStatus::Invalid),
            MissionState::Pending
        );
        assert_eq!(
            mission_to_tree_state(MissionState::Canceled),
            TreeStatus::Failure
        );
        assert_eq!(
            mission_to_tree_state(MissionState::Pending),
            TreeStatus::Invalid
        );
    }
}
