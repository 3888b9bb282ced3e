//! The per-robot actor.
//!
//! One [`RobotAgent`] owns everything about a single robot: its mission
//! queue, the current behavior tree, the VDA5050 header counter, the online
//! watchdog, and the table of outstanding instant actions.  Events arrive on
//! a single-consumer inbox and are processed strictly one at a time, so no
//! agent-local state ever needs a lock.  Timers post back into the same
//! inbox instead of touching state from their own tasks.
//!
//! The agent never lets an error escape its loop; every failure becomes a
//! state transition persisted through the store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetd_broker::Broker;
use fleetd_store::Store;
use fleetd_tree::{tree_to_mission_state, MissionBehaviorTree, Tip};
use fleetd_types::mission::{MissionNodeKind, NotifyNode};
use fleetd_types::{
    MissionFailureCategory, MissionObject, MissionState, ObjectLifecycle, RobotHardwareVersion,
    RobotObject, RobotState, ROOT_NODE,
};
use fleetd_vda5050::{
    split_order_id, Action, ActionStatus, ErrorLevel, InstantActionKind, InstantActions, Order,
    State, VendorActionType,
};

use crate::event::{AgentEvent, DeadlineKind};
use crate::mission_control::MissionControl;
use crate::notify;

/// Feedback messages buffered while no robot object exists yet.
const PENDING_FEEDBACK_CAP: usize = 32;

/// Handle kept by the dispatcher for one running agent.
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentEvent>,
    join: JoinHandle<()>,
}

impl AgentHandle {
    /// Deliver an event; returns it back if the agent has terminated.
    pub fn send(&self, event: AgentEvent) -> Result<(), AgentEvent> {
        self.tx.send(event).map_err(|err| err.0)
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Manages the mission state of a particular robot.
pub struct RobotAgent<S: Store, B: Broker> {
    name: String,
    store: S,
    broker: Arc<B>,
    mission_control: Option<MissionControl>,
    inbox: mpsc::UnboundedReceiver<AgentEvent>,
    self_tx: mpsc::UnboundedSender<AgentEvent>,
    http: reqwest::Client,

    robot: Option<RobotObject>,
    current: Option<MissionObject>,
    queue: VecDeque<MissionObject>,
    tree: Option<MissionBehaviorTree>,
    last_tip: Option<Tip>,
    header_id: u64,
    outstanding_actions: Vec<Action>,
    pending_feedback: Vec<State>,

    online_watchdog: Option<JoinHandle<()>>,
    watchdog_epoch: u64,
    /// A cancel ack is pending that should re-dispatch the updated leaf
    /// rather than cancel the mission.
    resend_after_cancel: bool,
    /// A charging mission was already requested for the current low-battery
    /// episode.
    charging_requested: bool,
    alive: bool,
}

impl<S: Store, B: Broker> RobotAgent<S, B> {
    /// Spawn the agent task and return its handle.
    pub fn spawn(
        name: impl Into<String>,
        store: S,
        broker: Arc<B>,
        mission_control: Option<MissionControl>,
    ) -> AgentHandle {
        let (agent, tx) = Self::new(name, store, broker, mission_control);
        let join = tokio::spawn(agent.run());
        AgentHandle { tx, join }
    }

    fn new(
        name: impl Into<String>,
        store: S,
        broker: Arc<B>,
        mission_control: Option<MissionControl>,
    ) -> (Self, mpsc::UnboundedSender<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Self {
            name: name.into(),
            store,
            broker,
            mission_control,
            inbox: rx,
            self_tx: tx.clone(),
            http: reqwest::Client::new(),
            robot: None,
            current: None,
            queue: VecDeque::new(),
            tree: None,
            last_tip: None,
            header_id: 0,
            outstanding_actions: Vec::new(),
            pending_feedback: Vec::new(),
            online_watchdog: None,
            watchdog_epoch: 0,
            resend_after_cancel: false,
            charging_requested: false,
            alive: true,
        };
        (agent, tx)
    }

    /// Drain the inbox until the robot is deleted.
    pub async fn run(mut self) {
        while self.alive {
            let Some(event) = self.inbox.recv().await else {
                break;
            };
            self.handle_event(event).await;
        }
        debug!(robot = %self.name, "agent stopped");
    }

    async fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Robot(robot) => self.on_robot_change(robot).await,
            AgentEvent::Mission(mission) => self.on_mission_change(mission).await,
            AgentEvent::Feedback(state) => self.on_feedback(state).await,
            AgentEvent::OnlineDeadline { epoch } => self.on_online_deadline(epoch).await,
            AgentEvent::MissionDeadline { mission, kind } => {
                self.on_mission_deadline(mission, kind).await
            }
            AgentEvent::Kick => self.try_start_mission().await,
        }
    }

    // ------------------------------------------------------------------
    // Robot events
    // ------------------------------------------------------------------

    async fn on_robot_change(&mut self, message: RobotObject) {
        if self.robot.is_none() {
            info!(robot = %self.name, "created robot");
            self.robot = Some(message);
            self.header_id = 0;
            self.arm_watchdog();
            let buffered = std::mem::take(&mut self.pending_feedback);
            for state in buffered {
                self.on_feedback(state).await;
            }
            self.try_start_mission().await;
            return;
        }

        if message.lifecycle == ObjectLifecycle::PendingDelete {
            if let Some(robot) = self.robot.as_mut() {
                robot.lifecycle = ObjectLifecycle::PendingDelete;
            }
            let busy = self
                .current
                .as_ref()
                .is_some_and(|mission| !mission.status.state.is_terminal());
            if busy {
                if let Some(current) = self.current.as_mut() {
                    current.status.failure_reason = Some("Robot deleted".to_string());
                }
                self.set_mission_state(MissionState::Failed).await;
                self.next_mission().await;
            } else {
                debug!(robot = %self.name, "robot is idle and delete requested, deleting");
                self.delete_robot().await;
            }
            return;
        }

        // Teleop toggle: compare the requested mode against the tracked one.
        let toggle = {
            let in_teleop = self
                .robot
                .as_ref()
                .is_some_and(|robot| robot.status.state == RobotState::Teleop);
            if message.spec.switch_teleop && !in_teleop {
                Some(InstantActionKind::StartTeleop)
            } else if !message.spec.switch_teleop && in_teleop {
                Some(InstantActionKind::StopTeleop)
            } else {
                None
            }
        };
        if let Some(kind) = toggle {
            info!(robot = %self.name, action = kind.as_str(), "sending teleop action");
            self.issue_instant_action(kind).await;
        }

        self.robot = Some(message);
    }

    async fn on_online_deadline(&mut self, epoch: u64) {
        if epoch != self.watchdog_epoch {
            return;
        }
        let Some(robot) = self.robot.as_mut() else {
            return;
        };
        if !robot.status.online {
            return;
        }
        info!(robot = %self.name, "robot offline");
        robot.status.online = false;
        self.persist_robot_status().await;
    }

    fn arm_watchdog(&mut self) {
        let Some(robot) = &self.robot else {
            return;
        };
        if let Some(handle) = self.online_watchdog.take() {
            handle.abort();
        }
        self.watchdog_epoch += 1;
        let epoch = self.watchdog_epoch;
        let delay = robot.spec.heartbeat_timeout;
        let tx = self.self_tx.clone();
        self.online_watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(AgentEvent::OnlineDeadline { epoch });
        }));
    }

    async fn delete_robot(&mut self) {
        if let Some(robot) = self.robot.as_mut() {
            robot.lifecycle = ObjectLifecycle::Deleted;
        }
        if let Some(handle) = self.online_watchdog.take() {
            handle.abort();
        }
        if let Err(err) = self.store.delete::<RobotObject>(&self.name).await {
            warn!(robot = %self.name, error = %err, "failed to delete robot from store");
        }
        self.alive = false;
    }

    // ------------------------------------------------------------------
    // Mission events
    // ------------------------------------------------------------------

    async fn on_mission_change(&mut self, message: MissionObject) {
        let name = message.name.clone();
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|mission| mission.name == name);
        let queue_pos = self.queue.iter().position(|mission| mission.name == name);

        if !is_current && queue_pos.is_none() {
            info!(robot = %self.name, mission = %name, "received new mission");
            self.queue.push_back(message);
            if self.current.is_none() {
                self.try_start_mission().await;
            }
            return;
        }

        if is_current {
            self.on_current_mission_update(message).await;
            return;
        }

        // Update to a queued, not-yet-started mission.
        info!(robot = %self.name, mission = %name, "updating queued mission");
        let Some(pos) = queue_pos else { return };
        if let Some(queued) = self.queue.get_mut(pos) {
            Self::apply_mission_update(queued, &message);
            if queued.lifecycle == ObjectLifecycle::PendingDelete {
                if let Err(err) = self.store.delete::<MissionObject>(&name).await {
                    warn!(mission = %name, error = %err, "failed to delete queued mission");
                }
                self.queue.remove(pos);
            } else if queued.spec.needs_canceled {
                queued.status.state = MissionState::Canceled;
                queued
                    .status
                    .set_node_state(ROOT_NODE, MissionState::Canceled);
                queued.status.end_timestamp = Some(Utc::now());
                queued.status.failure_category = Some(MissionFailureCategory::Canceled);
                let status = queued.status.clone();
                if let Err(err) = self
                    .store
                    .update_status::<MissionObject>(&name, &status)
                    .await
                {
                    warn!(mission = %name, error = %err, "failed to persist canceled mission");
                }
                self.queue.remove(pos);
            }
        }
    }

    async fn on_current_mission_update(&mut self, message: MissionObject) {
        let name = message.name.clone();
        info!(robot = %self.name, mission = %name, "updating current mission");
        let cancel_node = {
            let Some(current) = self.current.as_mut() else {
                return;
            };
            let cancel_node = Self::apply_mission_update(current, &message);
            if current.lifecycle == ObjectLifecycle::PendingDelete {
                current.spec.needs_canceled = true;
            }
            cancel_node
        };

        let (needs_canceled, state) = {
            let Some(current) = self.current.as_ref() else {
                return;
            };
            (current.spec.needs_canceled, current.status.state)
        };

        // A mission that never emitted an order cancels immediately, without
        // the cancelOrder round trip.
        if needs_canceled && state == MissionState::Pending {
            if let Some(current) = self.current.as_mut() {
                current.status.failure_category = Some(MissionFailureCategory::Canceled);
            }
            self.set_mission_state(MissionState::Canceled).await;
            self.post_mission_completion().await;
            return;
        }

        if needs_canceled || cancel_node {
            info!(robot = %self.name, mission = %name, "cancelling current order");
            self.issue_instant_action(InstantActionKind::CancelOrder).await;
        }
    }

    /// Fold an updated mission object from the store into the local copy.
    /// Returns whether a currently-running route node was rewritten and the
    /// in-flight order must be canceled first.
    fn apply_mission_update(mission: &mut MissionObject, message: &MissionObject) -> bool {
        // From the cancel endpoint.
        if mission.spec.needs_canceled != message.spec.needs_canceled {
            info!(
                mission = %mission.name,
                state = ?mission.status.state,
                "cancel requested"
            );
            mission.spec.needs_canceled = message.spec.needs_canceled;
            return false;
        }

        // From the delete endpoint.
        if mission.lifecycle != message.lifecycle {
            info!(
                mission = %mission.name,
                lifecycle = ?message.lifecycle,
                "mission lifecycle changed"
            );
            mission.lifecycle = message.lifecycle;
            return false;
        }

        // From the update endpoint: rewrite named route leaves.
        let mut cancel_node = false;
        if let Some(updates) = &message.spec.update_nodes {
            info!(mission = %mission.name, nodes = ?updates.keys().collect::<Vec<_>>(), "updating mission nodes");
            for (node_name, route) in updates {
                let Some(index) = mission.node_index(node_name) else {
                    continue;
                };
                if let MissionNodeKind::Route(existing) =
                    &mut mission.spec.mission_tree[index].kind
                {
                    *existing = route.clone();
                    if mission.status.node_state(node_name) == MissionState::Running {
                        cancel_node = true;
                    }
                }
            }
        }
        cancel_node
    }

    // ------------------------------------------------------------------
    // Mission scheduling
    // ------------------------------------------------------------------

    async fn try_start_mission(&mut self) {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
        }
        let Some(current) = &self.current else {
            debug!(robot = %self.name, "could not find a new mission to run");
            return;
        };
        let name = current.name.clone();
        let timeout = current.spec.timeout;
        let deadline = current.spec.deadline;

        let Some(robot) = &self.robot else {
            return;
        };
        if robot.lifecycle != ObjectLifecycle::Alive {
            return;
        }

        // A mission whose deadline already passed fails without emitting an
        // order.
        if let Some(deadline) = deadline {
            if deadline <= Utc::now() {
                if let Some(current) = self.current.as_mut() {
                    current.status.failure_reason = Some("Mission deadline reached".to_string());
                    current.status.failure_category = Some(MissionFailureCategory::Deadline);
                }
                self.set_mission_state(MissionState::Failed).await;
                self.next_mission().await;
                return;
            }
        }

        match MissionBehaviorTree::build(current) {
            Ok(tree) => self.tree = Some(tree),
            Err(err) => {
                if let Some(current) = self.current.as_mut() {
                    current.status.failure_reason = Some(err.to_string());
                }
                self.set_mission_state(MissionState::Failed).await;
                self.next_mission().await;
                return;
            }
        }

        self.update_from_tree().await;
        self.spawn_mission_timer(name.clone(), timeout, DeadlineKind::Timeout);
        if let Some(deadline) = deadline {
            let delay = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.spawn_mission_timer(name, delay, DeadlineKind::Deadline);
        }
        self.send_order().await;
    }

    fn spawn_mission_timer(&self, mission: String, delay: Duration, kind: DeadlineKind) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(AgentEvent::MissionDeadline { mission, kind });
        });
    }

    async fn on_mission_deadline(&mut self, mission: String, kind: DeadlineKind) {
        let relevant = self.current.as_ref().is_some_and(|current| {
            current.name == mission && current.status.state == MissionState::Running
        });
        if !relevant {
            return;
        }
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.lifecycle == ObjectLifecycle::PendingDelete)
        {
            if let Err(err) = self.store.delete::<MissionObject>(&mission).await {
                warn!(mission = %mission, error = %err, "failed to delete mission");
            }
            self.next_mission().await;
            return;
        }
        let (reason, category) = match kind {
            DeadlineKind::Timeout => ("Mission timed out", MissionFailureCategory::Timeout),
            DeadlineKind::Deadline => (
                "Mission deadline reached",
                MissionFailureCategory::Deadline,
            ),
        };
        if let Some(current) = self.current.as_mut() {
            current.status.failure_reason = Some(reason.to_string());
            current.status.failure_category = Some(category);
        }
        self.set_mission_state(MissionState::Failed).await;
        self.set_robot_state(RobotState::Idle).await;
        self.next_mission().await;
    }

    async fn post_mission_completion(&mut self) {
        let pending_delete = {
            let Some(current) = &self.current else { return };
            current.lifecycle == ObjectLifecycle::PendingDelete
        };
        if pending_delete {
            if let Some(name) = self.current.as_ref().map(|c| c.name.clone()) {
                if let Err(err) = self.store.delete::<MissionObject>(&name).await {
                    warn!(mission = %name, error = %err, "failed to delete finished mission");
                }
            }
        }
        self.set_robot_state(RobotState::Idle).await;
        self.next_mission().await;
    }

    async fn next_mission(&mut self) {
        self.current = None;
        self.tree = None;
        self.last_tip = None;
        self.resend_after_cancel = false;
        if self
            .robot
            .as_ref()
            .is_some_and(|robot| robot.lifecycle == ObjectLifecycle::PendingDelete)
        {
            self.delete_robot().await;
        } else {
            // Start the next queued mission on a fresh inbox turn.
            let _ = self.self_tx.send(AgentEvent::Kick);
        }
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    async fn send_order(&mut self) {
        loop {
            enum Work {
                Notify(String, NotifyNode),
                Publish(String, Order),
            }

            let work = {
                let Some(robot) = &self.robot else { return };
                if !matches!(
                    robot.lifecycle,
                    ObjectLifecycle::Alive | ObjectLifecycle::PendingDelete
                ) {
                    return;
                }
                if robot.status.state == RobotState::Teleop {
                    debug!(robot = %self.name, "in teleop, not sending orders");
                    return;
                }
                let Some(current) = &self.current else { return };
                if self.tree.is_none() {
                    return;
                }
                let Some(tip) = &self.last_tip else {
                    info!(robot = %self.name, mission = %current.name, "no available order to be sent");
                    return;
                };
                let index = tip.index;
                let Some(node) = current.spec.mission_tree.get(index) else {
                    return;
                };
                let leaf = node.name().to_string();
                let built = match &node.kind {
                    MissionNodeKind::Notify(notify_node) => {
                        Ok(Work::Notify(leaf.clone(), notify_node.clone()))
                    }
                    MissionNodeKind::Route(route) => {
                        Order::from_route(route, robot, &current.name, index)
                            .map(|order| Work::Publish(leaf.clone(), order))
                    }
                    MissionNodeKind::Move(movement) => {
                        Order::from_move(movement, robot, &current.name, index)
                            .map(|order| Work::Publish(leaf.clone(), order))
                    }
                    MissionNodeKind::Action(action) => {
                        Order::from_action(action, robot, &current.name, index)
                            .map(|order| Work::Publish(leaf.clone(), order))
                    }
                    MissionNodeKind::Sequence {}
                    | MissionNodeKind::Selector {}
                    | MissionNodeKind::Constant(_) => {
                        warn!(robot = %self.name, node = %leaf, "tip is not an executable leaf");
                        return;
                    }
                };
                match built {
                    Ok(work) => work,
                    Err(err) => {
                        if let Some(current) = self.current.as_mut() {
                            current.status.failure_reason = Some(err.to_string());
                        }
                        self.set_mission_state(MissionState::Failed).await;
                        self.post_mission_completion().await;
                        return;
                    }
                }
            };

            match work {
                Work::Notify(leaf, notify_node) => {
                    info!(robot = %self.name, node = %leaf, url = %notify_node.url, "running notify node");
                    self.set_node_state(&leaf, MissionState::Running);
                    let result = notify::execute(&self.http, &notify_node).await;
                    self.set_node_state(&leaf, result);
                    self.update_from_tree().await;
                    let terminal = self
                        .current
                        .as_ref()
                        .is_none_or(|current| current.status.state.is_terminal());
                    if terminal {
                        self.post_mission_completion().await;
                        return;
                    }
                    // The next leaf may be another notify or an order.
                    continue;
                }
                Work::Publish(leaf, mut order) => {
                    info!(
                        robot = %self.name,
                        node = %leaf,
                        order = %order.order_id,
                        "sending mission node"
                    );
                    order.header_id = self.header_id;
                    self.header_id += 1;
                    order.timestamp = Utc::now().to_rfc3339();
                    if let Err(err) = self.broker.publish_order(&self.name, &order).await {
                        warn!(robot = %self.name, error = %err, "failed to publish order");
                    }
                    self.set_node_state(&leaf, MissionState::Running);
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Instant actions
    // ------------------------------------------------------------------

    async fn issue_instant_action(&mut self, kind: InstantActionKind) {
        let prefix = self
            .current
            .as_ref()
            .map(|mission| mission.name.clone())
            .unwrap_or_else(|| self.name.clone());
        let action = Action::instant(kind, &prefix, self.header_id);
        self.outstanding_actions.push(action.clone());
        self.publish_instant_action(action).await;
    }

    async fn publish_instant_action(&mut self, action: Action) {
        let message = InstantActions::single(self.header_id, Utc::now().to_rfc3339(), action);
        self.header_id += 1;
        if let Err(err) = self.broker.publish_instant_actions(&self.name, &message).await {
            warn!(robot = %self.name, error = %err, "failed to publish instant action");
        }
    }

    /// Acknowledge finished instant actions from the feedback and retransmit
    /// any outstanding ones it did not mention.  Returns the finished ones.
    async fn handle_instant_actions(&mut self, state: &State) -> Vec<Action> {
        let mut acknowledged: Vec<String> = Vec::new();
        let mut finished: Vec<Action> = Vec::new();
        // Instant actions are appended to the robot's action states; scan in
        // reverse and stop at the first entry that is not one.
        for action_state in state.action_states.iter().rev() {
            if InstantActionKind::from_action_type(&action_state.action_type).is_none() {
                break;
            }
            let Some(pos) = self
                .outstanding_actions
                .iter()
                .position(|action| action.action_id == action_state.action_id)
            else {
                continue;
            };
            if action_state.action_status == ActionStatus::Finished {
                let action = self.outstanding_actions.remove(pos);
                info!(robot = %self.name, action = %action.action_id, "finished instant action");
                finished.push(action);
            }
            acknowledged.push(action_state.action_id.clone());
        }

        let resend: Vec<Action> = self
            .outstanding_actions
            .iter()
            .filter(|action| !acknowledged.contains(&action.action_id))
            .cloned()
            .collect();
        for action in resend {
            info!(robot = %self.name, action = %action.action_id, "resending instant action");
            self.publish_instant_action(action).await;
        }
        finished
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    async fn on_feedback(&mut self, state: State) {
        if self.robot.is_none() {
            // Tolerate feedback racing ahead of the robot object; replayed
            // once the robot exists.
            if self.pending_feedback.len() < PENDING_FEEDBACK_CAP {
                self.pending_feedback.push(state);
            }
            return;
        }

        self.arm_watchdog();
        self.update_robot_from_feedback(&state).await;

        let finished = self.handle_instant_actions(&state).await;
        self.apply_teleop_acks(&finished).await;

        if self.current.is_none() || self.tree.is_none() {
            return;
        }

        // The mission may have been failed by a timer while this feedback
        // was in flight.
        let terminal = self
            .current
            .as_ref()
            .is_some_and(|current| current.status.state.is_terminal());
        if terminal {
            self.set_robot_state(RobotState::Idle).await;
            self.next_mission().await;
            return;
        }

        // Stale feedback from another order: re-assert the current one.
        let (mission_name, matches) = {
            let Some(current) = &self.current else { return };
            (current.name.clone(), state.matches_mission(&current.name))
        };
        if !matches {
            info!(
                robot = %self.name,
                mission = %mission_name,
                order = %state.order_id,
                "got feedback from another mission order"
            );
            self.send_order().await;
            return;
        }

        let previous_tip = self.last_tip.clone();
        self.update_mission_state(&state, &finished).await;

        if self.resend_after_cancel {
            // The cancel made room for an updated leaf: reset it and
            // re-dispatch its order.
            self.resend_after_cancel = false;
            if let Some(tip) = self.last_tip.clone() {
                info!(robot = %self.name, node = %tip.name, "resending updated mission node");
                self.set_node_state(&tip.name, MissionState::Pending);
            }
            self.update_from_tree().await;
            self.send_order().await;
            return;
        }

        if previous_tip != self.last_tip && self.last_tip.is_some() {
            self.send_order().await;
        }

        let terminal = self
            .current
            .as_ref()
            .is_some_and(|current| current.status.state.is_terminal());
        if terminal {
            self.post_mission_completion().await;
        }
    }

    /// Fold pose, battery, version, and info data from the feedback into the
    /// robot status and persist it.
    async fn update_robot_from_feedback(&mut self, state: &State) {
        let mut battery_charging = None;
        {
            let Some(robot) = self.robot.as_mut() else {
                return;
            };
            if let Some(position) = &state.agv_position {
                robot.status.pose.x = position.x;
                robot.status.pose.y = position.y;
                robot.status.pose.theta = position.theta;
                robot.status.pose.map_id = position.map_id.clone();
            }
            if let Some(battery) = &state.battery_state {
                robot.status.battery_level = battery.battery_charge;
                battery_charging = Some(battery.charging);
            }
            if !robot.status.online {
                info!(robot = %self.name, "robot online");
            }
            robot.status.online = true;
            if let Some(user_info) = state.user_info() {
                robot.status.info_messages = Some(user_info);
            }
            robot.status.hardware_version = RobotHardwareVersion {
                manufacturer: state.manufacturer.clone(),
                serial_number: state.serial_number.clone(),
            };
        }

        if let Some(charging) = battery_charging {
            let robot_state = self
                .robot
                .as_ref()
                .map(|robot| robot.status.state)
                .unwrap_or_default();
            if charging && !robot_state.is_running() {
                self.set_robot_state(RobotState::Charging).await;
                self.charging_requested = false;
            } else if robot_state == RobotState::Charging && !charging {
                self.set_robot_state(RobotState::Idle).await;
            }
        }

        self.run_mission_control_side_calls().await;
        self.persist_robot_status().await;
    }

    /// Best-effort map deployment and charging-mission requests.
    async fn run_mission_control_side_calls(&mut self) {
        let Some(control) = self.mission_control.clone() else {
            return;
        };
        let (request_map, request_charging) = {
            let Some(robot) = &self.robot else { return };
            let request_map =
                robot.status.pose.map_id.is_empty() && robot.status.state.can_deploy_map();
            let request_charging = robot
                .spec
                .battery
                .recommended_minimum
                .is_some_and(|minimum| robot.status.battery_level <= minimum)
                && !robot.status.state.is_running()
                && !self.charging_requested;
            (request_map, request_charging)
        };
        if !request_map && !request_charging {
            return;
        }
        if !control.healthy().await {
            return;
        }
        if request_map && control.push_map(&self.name).await {
            self.set_robot_state(RobotState::MapDeployment).await;
        }
        if request_charging && control.request_charging(&self.name).await {
            self.charging_requested = true;
        }
    }

    async fn apply_teleop_acks(&mut self, finished: &[Action]) {
        for action in finished {
            match InstantActionKind::from_action_type(&action.action_type) {
                Some(InstantActionKind::StartTeleop) => {
                    info!(robot = %self.name, "switch to teleop");
                    self.set_robot_state(RobotState::Teleop).await;
                }
                Some(InstantActionKind::StopTeleop) => {
                    info!(robot = %self.name, "stop teleop");
                    let resume = if self.current.is_some() {
                        RobotState::OnTask
                    } else {
                        RobotState::Idle
                    };
                    self.set_robot_state(resume).await;
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Mission state reconciliation
    // ------------------------------------------------------------------

    async fn update_mission_state(&mut self, state: &State, finished: &[Action]) {
        if self.current.is_none() || self.robot.is_none() || self.tree.is_none() {
            return;
        }
        let node_state = self.update_mission_node_state(state, finished).await;
        if node_state == MissionState::Canceled {
            let needs_canceled = self
                .current
                .as_ref()
                .is_some_and(|current| current.spec.needs_canceled);
            if needs_canceled {
                if let Some(current) = self.current.as_mut() {
                    current.status.failure_category = Some(MissionFailureCategory::Canceled);
                }
                self.set_mission_state(MissionState::Canceled).await;
            } else {
                // The cancel was the make-room-for-an-update signal.
                self.resend_after_cancel = true;
            }
            return;
        }
        self.update_from_tree().await;
    }

    /// Reconcile the state of the mission node referenced by the feedback's
    /// order id, applying the leaf completion rules.
    async fn update_mission_node_state(
        &mut self,
        state: &State,
        finished: &[Action],
    ) -> MissionState {
        let Some((_, index)) = split_order_id(&state.order_id) else {
            return MissionState::Pending;
        };
        let (node_name, mut node_state, node_kind_teleop) = {
            let Some(current) = &self.current else {
                return MissionState::Pending;
            };
            let Some(node) = current.spec.mission_tree.get(index) else {
                warn!(mission = %current.name, index, "order references unknown mission node");
                return MissionState::Pending;
            };
            let node_name = node.name().to_string();
            let mut node_state = current.status.node_state(&node_name);
            let mut teleop = false;
            let current_order_node = state.current_order_node_id();
            match &node.kind {
                MissionNodeKind::Route(route) => {
                    if current_order_node == route.size() as u64 * 2 + 2 {
                        node_state = MissionState::Completed;
                    }
                }
                MissionNodeKind::Move(_) => {
                    if current_order_node == 4 {
                        node_state = MissionState::Completed;
                    }
                }
                MissionNodeKind::Action(_) => {
                    if let Some(action_state) = state.action_states.first() {
                        match action_state.action_status {
                            ActionStatus::Finished => node_state = MissionState::Completed,
                            ActionStatus::Failed => node_state = MissionState::Failed,
                            _ => {
                                teleop = action_state.action_type
                                    == VendorActionType::PAUSE_ORDER;
                            }
                        }
                    }
                }
                _ => {}
            }
            (node_name, node_state, teleop)
        };

        if node_kind_teleop
            && self
                .robot
                .as_ref()
                .is_some_and(|robot| robot.status.state != RobotState::Teleop)
        {
            info!(robot = %self.name, "switch to teleop");
            self.set_robot_state(RobotState::Teleop).await;
        }

        // A cancel ack overrides the completion rules.
        if finished.iter().any(|action| {
            InstantActionKind::from_action_type(&action.action_type)
                == Some(InstantActionKind::CancelOrder)
        }) {
            node_state = MissionState::Canceled;
        }

        if self.collect_fatal_errors(state) {
            warn!(robot = %self.name, "fatal errors present, failing mission");
            node_state = MissionState::Failed;
        }

        self.set_node_state(&node_name, node_state);
        node_state
    }

    /// Fold FATAL errors into the referenced leaves' `error_msg` and the
    /// mission's `failure_reason`.  WARNING-level errors are ignored.
    fn collect_fatal_errors(&mut self, state: &State) -> bool {
        if state.errors.is_empty() {
            return false;
        }
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        let mut fatal = false;
        for error in &state.errors {
            if error.error_level != ErrorLevel::Fatal {
                continue;
            }
            fatal = true;
            for reference in &error.error_references {
                if !matches!(
                    reference.reference_key.as_str(),
                    "node_id" | "nodeId" | "action_id" | "actionId"
                ) {
                    continue;
                }
                let Some(index) = fleetd_vda5050::reference_node_index(&reference.reference_value)
                else {
                    continue;
                };
                let Some(node) = current.spec.mission_tree.get(index) else {
                    continue;
                };
                let name = node.name().to_string();
                current
                    .status
                    .node_status
                    .entry(name)
                    .or_default()
                    .error_msg = Some(error.error_description.clone());
                current.status.failure_reason = Some(
                    state
                        .errors
                        .iter()
                        .map(|e| e.error_description.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                );
            }
        }
        fatal
    }

    /// Tick the tree, mirror the fold into the mission state, and persist
    /// the status when anything changed.
    async fn update_from_tree(&mut self) {
        let (previous, root_state) = {
            let Some(tree) = &self.tree else { return };
            let Some(current) = self.current.as_mut() else {
                return;
            };
            let previous = current.status.clone();
            let outcome = tree.tick(&mut current.status);
            self.last_tip = outcome.tip;
            (previous, tree_to_mission_state(outcome.root))
        };

        let state_changed = self.set_mission_state(root_state).await;
        if state_changed {
            return;
        }
        // Node statuses may have moved even when the mission state did not.
        let changed = self
            .current
            .as_ref()
            .is_some_and(|current| current.status != previous);
        if changed {
            self.persist_current_mission().await;
        }
    }

    /// Transition the mission state, stamping timestamps and mirroring the
    /// root node.  Returns whether a transition happened (and was persisted).
    async fn set_mission_state(&mut self, state: MissionState) -> bool {
        let became_running = {
            let Some(current) = self.current.as_mut() else {
                return false;
            };
            if current.status.state == state {
                return false;
            }
            info!(
                robot = %self.name,
                mission = %current.name,
                from = ?current.status.state,
                to = ?state,
                "mission state change"
            );
            current.status.state = state;
            current.status.set_node_state(ROOT_NODE, state);
            let mut became_running = false;
            if state == MissionState::Running {
                if current.status.start_timestamp.is_none() {
                    current.status.start_timestamp = Some(Utc::now());
                    became_running = true;
                }
            } else if state.is_terminal() {
                current.status.end_timestamp = Some(Utc::now());
                // Timer/cancel paths stamp their category first; anything
                // else that fails was reported by the robot side.
                if current.status.failure_category.is_none() {
                    if state == MissionState::Failed {
                        current.status.failure_category = Some(MissionFailureCategory::RobotApp);
                    } else if state == MissionState::Canceled {
                        current.status.failure_category = Some(MissionFailureCategory::Canceled);
                    }
                }
                if let Some(reason) = &current.status.failure_reason {
                    if state == MissionState::Failed {
                        info!(mission = %current.name, reason = %reason, "mission failed");
                    }
                }
            }
            became_running
        };
        if became_running {
            self.set_robot_state(RobotState::OnTask).await;
        }
        self.persist_current_mission().await;
        true
    }

    fn set_node_state(&mut self, name: &str, state: MissionState) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let previous = current.status.node_state(name);
        if previous == state {
            return;
        }
        info!(
            mission = %current.name,
            node = %name,
            from = ?previous,
            to = ?state,
            "node state change"
        );
        current.status.set_node_state(name, state);
    }

    async fn set_robot_state(&mut self, state: RobotState) {
        let changed = {
            let Some(robot) = self.robot.as_mut() else {
                return;
            };
            if robot.status.state == state {
                false
            } else {
                info!(
                    robot = %self.name,
                    from = ?robot.status.state,
                    to = ?state,
                    "robot state change"
                );
                robot.status.state = state;
                true
            }
        };
        if changed {
            self.persist_robot_status().await;
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn persist_robot_status(&self) {
        let Some(robot) = &self.robot else { return };
        if robot.lifecycle == ObjectLifecycle::Deleted {
            return;
        }
        if let Err(err) = self
            .store
            .update_status::<RobotObject>(&self.name, &robot.status)
            .await
        {
            warn!(robot = %self.name, error = %err, "failed to persist robot status");
        }
    }

    async fn persist_current_mission(&self) {
        let Some(current) = &self.current else { return };
        if let Err(err) = self
            .store
            .update_status::<MissionObject>(&current.name, &current.status)
            .await
        {
            warn!(mission = %current.name, error = %err, "failed to persist mission status");
        }
    }
}
