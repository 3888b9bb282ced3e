//! The mission execution engine: one [`RobotAgent`] actor per robot plus the
//! [`Dispatcher`] that fans store and broker events onto the agents.
//!
//! Event flow:
//!
//! ```text
//! Store.watch(Robot)   ─┐
//! Store.watch(Mission) ─┼─▶ Dispatcher ─▶ per-robot inbox ─▶ RobotAgent
//! Broker.subscribe     ─┘                                      │
//!                                                              ▼
//!                                        Store writes + Broker publishes
//! ```
//!
//! Each agent drains exactly one event at a time, so agent-local state needs
//! no locking; the three producers each run on their own task.

pub mod agent;
pub mod dispatcher;
pub mod event;
pub mod mission_control;
pub mod notify;
#[cfg(test)]
pub(crate) mod testing;

pub use agent::{AgentHandle, RobotAgent};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use event::{AgentEvent, DeadlineKind};
pub use mission_control::MissionControl;
