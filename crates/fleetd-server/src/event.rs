//! Events delivered to a robot agent's inbox.

use fleetd_types::{MissionObject, RobotObject};
use fleetd_vda5050::State;

/// Which per-mission timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// `spec.timeout` elapsed since the mission started.
    Timeout,
    /// The absolute `spec.deadline` passed.
    Deadline,
}

/// One unit of work for an agent.
///
/// The first three variants are fanned in by the dispatcher; the rest are
/// posted by the agent's own timer tasks so that *all* state changes flow
/// through the single-consumer inbox.
#[derive(Debug)]
pub enum AgentEvent {
    /// A new or updated robot object from the store.
    Robot(RobotObject),
    /// A new or updated mission object from the store.
    Mission(MissionObject),
    /// A parsed VDA5050 state message from the robot.
    Feedback(State),
    /// The online watchdog expired without feedback.
    OnlineDeadline {
        /// Watchdog generation; stale generations are ignored.
        epoch: u64,
    },
    /// A mission timer fired.
    MissionDeadline { mission: String, kind: DeadlineKind },
    /// Try to start the next queued mission.
    Kick,
}
