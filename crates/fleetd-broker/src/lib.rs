//! The broker port: VDA5050 topic plumbing over MQTT.
//!
//! The dispatcher subscribes once to `{prefix}/+/state` and publishes per
//! robot to `{prefix}/{robot}/order` and `{prefix}/{robot}/instantActions`.
//! [`MqttBroker`] is the production implementation; tests substitute a
//! channel-backed fake.

pub mod mqtt;
pub mod topic;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use fleetd_vda5050::{InstantActions, Order, State};

pub use mqtt::{MqttBroker, MqttConfig, MqttTransport};

/// A parsed `state` message together with the robot it came from.
#[derive(Debug, Clone)]
pub struct StateMessage {
    pub robot: String,
    pub state: State,
}

/// Stream of inbound robot state messages.
pub type StateStream = BoxStream<'static, StateMessage>;

/// Broker access failure.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("mqtt client error: {0}")]
    Client(String),
    #[error("state subscription already taken")]
    AlreadySubscribed,
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The broker port used by the dispatcher and every robot agent.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Take the single inbound state stream.  The dispatcher is the only
    /// consumer; calling this twice is an error.
    async fn subscribe_states(&self) -> Result<StateStream, BrokerError>;

    async fn publish_order(&self, robot: &str, order: &Order) -> Result<(), BrokerError>;

    async fn publish_instant_actions(
        &self,
        robot: &str,
        actions: &InstantActions,
    ) -> Result<(), BrokerError>;
}
