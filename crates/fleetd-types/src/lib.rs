//! Domain objects shared by every fleetd crate.
//!
//! The dispatcher deals in two persisted object kinds, [`RobotObject`] and
//! [`MissionObject`].  Both follow the same shape: a unique `name`, an
//! [`ObjectLifecycle`], a user-supplied *spec*, and a server-owned *status*.
//! The store is the single source of truth for all of them; everything in
//! this crate is plain data plus the validation rules enforced at creation.

pub mod common;
pub mod error;
pub mod mission;
pub mod robot;

pub use common::{ObjectLifecycle, Pose2D};
pub use error::DispatchError;
pub use mission::{
    ActionNode, ConstantNode, MissionFailureCategory, MissionNode, MissionNodeKind,
    MissionNodeStatus, MissionObject, MissionQueryParams, MissionSpec, MissionState,
    MissionStatus, MoveNode, NotifyNode, RouteNode, ROOT_NODE,
};
pub use robot::{
    RobotBatterySpec, RobotHardwareVersion, RobotObject, RobotQueryParams, RobotSoftwareVersion,
    RobotSpec, RobotState, RobotStatus,
};
