//! MQTT implementation of the broker port, built on rumqttc.
//!
//! One background task drives the rumqttc event loop: it (re)subscribes on
//! every connection acknowledgement, parses inbound state payloads, and
//! pushes them onto the channel handed out by `subscribe_states`.  Broker
//! connection loss is retried forever with a fixed backoff; publishes issued
//! while disconnected are queued by rumqttc and flushed on reconnect.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use fleetd_vda5050::{InstantActions, Order, State};

use crate::topic;
use crate::{Broker, BrokerError, StateMessage, StateStream};

/// How long to wait before retrying after a broker connection failure.
const MQTT_RECONNECT_PERIOD: Duration = Duration::from_millis(500);

/// Inbound state messages buffered while the dispatcher catches up.
const STATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttTransport {
    Tcp,
    Websockets,
}

/// Connection settings for [`MqttBroker`].
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub transport: MqttTransport,
    /// Path appended to the websocket URL when `transport` is websockets.
    pub ws_path: Option<String>,
    /// Topic prefix, e.g. `uagv/v2/RobotCompany`.
    pub prefix: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            transport: MqttTransport::Tcp,
            ws_path: None,
            prefix: "uagv/v2/RobotCompany".to_string(),
            client_id: format!("fleetd-dispatch-{}", std::process::id()),
        }
    }
}

/// MQTT-backed [`Broker`].
pub struct MqttBroker {
    client: AsyncClient,
    prefix: String,
    states: Mutex<Option<mpsc::Receiver<StateMessage>>>,
}

impl MqttBroker {
    /// Connect to the broker and start the event-loop driver task.
    pub fn connect(config: MqttConfig) -> Self {
        let options = Self::options(&config);
        let (client, mut event_loop) = AsyncClient::new(options, STATE_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);

        let subscriber = client.clone();
        let prefix = config.prefix.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!(prefix = %prefix, "connected to mqtt broker");
                        if let Err(err) = subscriber
                            .subscribe(topic::state_subscription(&prefix), QoS::AtMostOnce)
                            .await
                        {
                            warn!(error = %err, "failed to subscribe to state topic");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(robot) = topic::robot_from_state_topic(&prefix, &publish.topic)
                        else {
                            warn!(topic = %publish.topic, "message from unrecognized topic");
                            continue;
                        };
                        let state = match State::from_slice(&publish.payload) {
                            Ok(state) => state,
                            Err(err) => {
                                warn!(robot = %robot, error = %err, "undecodable state payload");
                                continue;
                            }
                        };
                        if tx.send(StateMessage { robot, state }).await.is_err() {
                            // Dispatcher went away; stop driving the loop.
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            error = %err,
                            "mqtt connection lost, retrying in {MQTT_RECONNECT_PERIOD:?}"
                        );
                        tokio::time::sleep(MQTT_RECONNECT_PERIOD).await;
                    }
                }
            }
        });

        Self {
            client,
            prefix: config.prefix,
            states: Mutex::new(Some(rx)),
        }
    }

    fn options(config: &MqttConfig) -> MqttOptions {
        let mut options = match config.transport {
            MqttTransport::Tcp => {
                MqttOptions::new(&config.client_id, &config.host, config.port)
            }
            MqttTransport::Websockets => {
                let path = config.ws_path.as_deref().unwrap_or("");
                let url = format!("ws://{}:{}{}", config.host, config.port, path);
                let mut options = MqttOptions::new(&config.client_id, url, config.port);
                options.set_transport(Transport::Ws);
                options
            }
        };
        options.set_keep_alive(Duration::from_secs(30));
        options
    }

    async fn publish_json(
        &self,
        topic: String,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|err| BrokerError::Client(err.to_string()))
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe_states(&self) -> Result<StateStream, BrokerError> {
        let rx = self
            .states
            .lock()
            .await
            .take()
            .ok_or(BrokerError::AlreadySubscribed)?;
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn publish_order(&self, robot: &str, order: &Order) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(order)?;
        self.publish_json(topic::order_topic(&self.prefix, robot), payload)
            .await
    }

    async fn publish_instant_actions(
        &self,
        robot: &str,
        actions: &InstantActions,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(actions)?;
        self.publish_json(topic::instant_actions_topic(&self.prefix, robot), payload)
            .await
    }
}
