//! VDA5050 v2 message types and the order/state codec.
//!
//! All wire structs serialize with the camelCase field names mandated by the
//! protocol so that existing robot clients interoperate bit-for-bit.  The
//! codec side maps mission-tree leaves onto [`Order`] messages and digests
//! [`State`] feedback back into mission progress.
//!
//! # Identifier scheme
//!
//! For a mission `m` executing the leaf at tree index `i`:
//!
//! | Id | Format |
//! |---|---|
//! | order | `m-n{i}` |
//! | order node | `m-n{i}-s{seq}` |
//! | order edge | `m-e{seq}` |
//! | instant action | `m-instantaction-n{header}` |
//!
//! Every order starts with a *seed node* at sequence 0 placed at the robot's
//! current pose; route waypoints occupy sequences 2, 4, 6, … with edges at
//! 1, 3, 5, … between them.

pub mod action;
pub mod order;
pub mod state;

pub use action::{
    Action, ActionParameter, BlockingType, InstantActionKind, InstantActions, VendorActionType,
};
pub use order::{Edge, Node, NodePosition, Order, OrderError};
pub use state::{
    ActionState, ActionStatus, AgvPosition, BatteryState, EdgeState, ErrorLevel, ErrorReference,
    Info, InfoReference, NodeState, OperatingMode, SafetyState, State, StateError, Velocity,
};

/// Protocol version stamped on every outbound message.
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Split an order id of the form `"{mission}-n{index}"`.
///
/// Returns `None` for anything else, including the legacy `{mission}-s0-n0`
/// form, which callers treat as stale feedback.
pub fn split_order_id(order_id: &str) -> Option<(&str, usize)> {
    let (mission, index) = order_id.rsplit_once("-n")?;
    if mission.is_empty() {
        return None;
    }
    let index = index.parse().ok()?;
    Some((mission, index))
}

/// Extract the mission-tree node index from a node/action id reference of the
/// form `"{mission}-n{index}[-s{seq}]"`.
pub fn reference_node_index(reference: &str) -> Option<usize> {
    let (_, tail) = reference.rsplit_once("-n")?;
    let index = tail.split_once("-s").map(|(idx, _)| idx).unwrap_or(tail);
    index.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_order_id_parses_current_form() {
        assert_eq!(split_order_id("survey-n3"), Some(("survey", 3)));
        assert_eq!(split_order_id("m-1-n0"), Some(("m-1", 0)));
    }

    #[test]
    fn split_order_id_rejects_legacy_and_garbage() {
        assert_eq!(split_order_id("survey-s0-n0x"), None);
        assert_eq!(split_order_id("survey"), None);
        assert_eq!(split_order_id(""), None);
        assert_eq!(split_order_id("-n1"), None);
    }

    #[test]
    fn reference_node_index_with_and_without_sequence() {
        assert_eq!(reference_node_index("survey-n2-s4"), Some(2));
        assert_eq!(reference_node_index("survey-n7"), Some(7));
        assert_eq!(reference_node_index("nonsense"), None);
    }
}
