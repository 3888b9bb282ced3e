//! VDA5050 topic construction and parsing.

/// The wildcard subscription covering every robot's state topic.
pub fn state_subscription(prefix: &str) -> String {
    format!("{prefix}/+/state")
}

pub fn order_topic(prefix: &str, robot: &str) -> String {
    format!("{prefix}/{robot}/order")
}

pub fn instant_actions_topic(prefix: &str, robot: &str) -> String {
    format!("{prefix}/{robot}/instantActions")
}

/// Extract the robot name from a `{prefix}/{robot}/state` topic.
///
/// Returns `None` for topics outside the prefix or with a nested robot
/// segment (robot names cannot contain `/`).
pub fn robot_from_state_topic(prefix: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let robot = rest.strip_suffix("/state")?;
    if robot.is_empty() || robot.contains('/') {
        return None;
    }
    Some(robot.to_string())
}
