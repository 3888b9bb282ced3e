//! Test doubles shared by the agent and dispatcher test suites.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use fleetd_broker::{Broker, BrokerError, StateMessage, StateStream};
use fleetd_vda5050::{InstantActions, Order};

/// Records every publish and hands out one injectable state stream.
pub struct FakeBroker {
    pub orders: Mutex<Vec<(String, Order)>>,
    pub instant_actions: Mutex<Vec<(String, InstantActions)>>,
    states: Mutex<Option<mpsc::UnboundedReceiver<StateMessage>>>,
}

impl FakeBroker {
    pub fn new() -> (Self, mpsc::UnboundedSender<StateMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                orders: Mutex::new(Vec::new()),
                instant_actions: Mutex::new(Vec::new()),
                states: Mutex::new(Some(rx)),
            },
            tx,
        )
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().expect("orders lock").len()
    }

    pub fn last_order(&self) -> Option<Order> {
        self.orders
            .lock()
            .expect("orders lock")
            .last()
            .map(|(_, order)| order.clone())
    }

    pub fn instant_action_types(&self) -> Vec<String> {
        self.instant_actions
            .lock()
            .expect("instant actions lock")
            .iter()
            .flat_map(|(_, msg)| msg.instant_actions.iter())
            .map(|action| action.action_type.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn subscribe_states(&self) -> Result<StateStream, BrokerError> {
        let rx = self
            .states
            .lock()
            .expect("states lock")
            .take()
            .ok_or(BrokerError::AlreadySubscribed)?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish_order(&self, robot: &str, order: &Order) -> Result<(), BrokerError> {
        self.orders
            .lock()
            .expect("orders lock")
            .push((robot.to_string(), order.clone()));
        Ok(())
    }

    async fn publish_instant_actions(
        &self,
        robot: &str,
        actions: &InstantActions,
    ) -> Result<(), BrokerError> {
        self.instant_actions
            .lock()
            .expect("instant actions lock")
            .push((robot.to_string(), actions.clone()));
        Ok(())
    }
}
