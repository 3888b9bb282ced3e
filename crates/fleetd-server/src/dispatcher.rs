//! Fan-out supervisor: three producer streams, one agent registry.
//!
//! The dispatcher owns the store watch streams for robots and missions and
//! the broker's state subscription.  Every event is keyed by robot name and
//! forwarded to that robot's agent, spawning the agent on first contact.
//! Transient store/broker failures are retried with a fixed backoff; a
//! structural store failure stops every agent and returns an error so the
//! process can exit and be restarted by its supervisor (all state is
//! rehydrated from the store on startup).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use fleetd_broker::{Broker, StateMessage};
use fleetd_store::{ApiObject, Store};
use fleetd_types::{DispatchError, MissionObject, ObjectLifecycle, RobotObject};

use crate::agent::{AgentHandle, RobotAgent};
use crate::event::AgentEvent;
use crate::mission_control::MissionControl;

/// How long to wait before re-subscribing a failed store watch.
const DB_RECONNECT_PERIOD: Duration = Duration::from_millis(500);

/// Dispatcher settings beyond the store and broker handles.
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Base URL of the optional mission-control service used for map
    /// deployment and charging missions.
    pub mission_control_url: Option<String>,
}

enum DispatchEvent {
    Robot(RobotObject),
    Mission(MissionObject),
    State(StateMessage),
    /// A producer hit a non-recoverable error; the process must restart.
    Fatal(String),
}

/// Spawns and feeds one [`RobotAgent`] per robot.
pub struct Dispatcher<S: Store, B: Broker> {
    store: S,
    broker: Arc<B>,
    mission_control: Option<MissionControl>,
    agents: HashMap<String, AgentHandle>,
}

impl<S: Store, B: Broker> Dispatcher<S, B> {
    pub fn new(store: S, broker: Arc<B>, config: DispatcherConfig) -> Self {
        Self {
            store,
            broker,
            mission_control: config.mission_control_url.map(MissionControl::new),
            agents: HashMap::new(),
        }
    }

    /// Run until a producer fails structurally.  Returns `Err` exactly when
    /// the process should exit with a failure code.
    pub async fn run(mut self) -> Result<(), DispatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let robot_watch = tokio::spawn(watch_objects::<S, RobotObject>(
            self.store.clone(),
            tx.clone(),
            DispatchEvent::Robot,
        ));
        let mission_watch = tokio::spawn(watch_objects::<S, MissionObject>(
            self.store.clone(),
            tx.clone(),
            DispatchEvent::Mission,
        ));
        let state_pump = tokio::spawn(pump_states(Arc::clone(&self.broker), tx.clone()));
        drop(tx);

        let result = loop {
            let Some(event) = rx.recv().await else {
                break Ok(());
            };
            match event {
                DispatchEvent::Robot(robot) => {
                    if robot.lifecycle == ObjectLifecycle::Deleted {
                        continue;
                    }
                    let name = robot.name.clone();
                    self.route(name, AgentEvent::Robot(robot));
                }
                DispatchEvent::Mission(mission) => {
                    if mission.lifecycle == ObjectLifecycle::Deleted {
                        continue;
                    }
                    if mission.status.state.is_terminal() {
                        // Nothing left to drive; clean up a deletion request.
                        if mission.lifecycle == ObjectLifecycle::PendingDelete {
                            if let Err(err) =
                                self.store.delete::<MissionObject>(&mission.name).await
                            {
                                warn!(mission = %mission.name, error = %err, "failed to delete finished mission");
                            }
                        }
                        continue;
                    }
                    let robot = mission.spec.robot.clone();
                    self.route(robot, AgentEvent::Mission(mission));
                }
                DispatchEvent::State(message) => {
                    let Some(handle) = self.agents.get(&message.robot) else {
                        warn!(robot = %message.robot, "ignoring state message from unknown robot");
                        continue;
                    };
                    if handle.send(AgentEvent::Feedback(message.state)).is_err() {
                        self.agents.remove(&message.robot);
                    }
                }
                DispatchEvent::Fatal(reason) => {
                    error!(reason = %reason, "non-recoverable producer failure, shutting down");
                    break Err(DispatchError::Server(reason));
                }
            }
        };

        robot_watch.abort();
        mission_watch.abort();
        state_pump.abort();
        for handle in self.agents.values() {
            handle.abort();
        }
        result
    }

    /// Forward an event to the robot's agent, spawning it on first contact
    /// and replacing it if the previous one terminated.
    fn route(&mut self, robot: String, event: AgentEvent) {
        if !self.agents.contains_key(&robot) {
            debug!(robot = %robot, "spawning agent");
            self.agents.insert(robot.clone(), self.spawn_agent(&robot));
        }
        let Some(handle) = self.agents.get(&robot) else {
            return;
        };
        if let Err(event) = handle.send(event) {
            // The agent self-terminated after its robot was deleted.  A
            // fresh ALIVE robot object for the same name starts over.
            self.agents.remove(&robot);
            if matches!(&event, AgentEvent::Robot(r) if r.lifecycle == ObjectLifecycle::Alive) {
                let handle = self.spawn_agent(&robot);
                let _ = handle.send(event);
                self.agents.insert(robot, handle);
            }
        }
    }

    fn spawn_agent(&self, robot: &str) -> AgentHandle {
        RobotAgent::spawn(
            robot,
            self.store.clone(),
            Arc::clone(&self.broker),
            self.mission_control.clone(),
        )
    }
}

/// Watch one object kind forever, reconnecting on transient failures and
/// reporting structural ones as fatal.
async fn watch_objects<S: Store, T: ApiObject>(
    store: S,
    tx: mpsc::UnboundedSender<DispatchEvent>,
    wrap: fn(T) -> DispatchEvent,
) {
    loop {
        match store.watch::<T>().await {
            Ok(mut stream) => loop {
                match stream.next().await {
                    Some(Ok(object)) => {
                        if tx.send(wrap(object)).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) if err.is_transient() => {
                        warn!(kind = T::alias(), error = %err, "watch failed, reconnecting");
                        break;
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(DispatchEvent::Fatal(format!(
                            "{} watch: {err}",
                            T::alias()
                        )));
                        return;
                    }
                    None => {
                        warn!(kind = T::alias(), "watch stream ended, reconnecting");
                        break;
                    }
                }
            },
            Err(err) if err.is_transient() => {
                warn!(kind = T::alias(), error = %err, "failed to connect watch, retrying");
            }
            Err(err) => {
                let _ = tx.send(DispatchEvent::Fatal(format!(
                    "{} watch: {err}",
                    T::alias()
                )));
                return;
            }
        }
        tokio::time::sleep(DB_RECONNECT_PERIOD).await;
    }
}

/// Forward broker state messages into the dispatcher loop.  The broker
/// implementation reconnects internally, so this stream only ends when the
/// dispatcher goes away.
async fn pump_states<B: Broker>(broker: Arc<B>, tx: mpsc::UnboundedSender<DispatchEvent>) {
    match broker.subscribe_states().await {
        Ok(mut stream) => {
            while let Some(message) = stream.next().await {
                if tx.send(DispatchEvent::State(message)).is_err() {
                    return;
                }
            }
        }
        Err(err) => {
            let _ = tx.send(DispatchEvent::Fatal(format!("broker subscribe: {err}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;
    use async_trait::async_trait;
    use fleetd_store::{MemoryStore, StoreError, WatchStream};
    use fleetd_types::mission::{MissionNode, MissionNodeKind, RouteNode};
    use fleetd_types::{MissionSpec, MissionState, Pose2D, RobotSpec};
    use fleetd_vda5050::State;
    use serde_json::json;

    fn robot(name: &str) -> RobotObject {
        RobotObject::new(name, RobotSpec::default())
    }

    fn mission(name: &str, robot: &str) -> MissionObject {
        MissionObject::new(
            name,
            MissionSpec::new(
                robot,
                vec![MissionNode::new(MissionNodeKind::Route(RouteNode {
                    waypoints: vec![Pose2D::new(1.0, 1.0, 0.0)],
                }))],
            ),
        )
        .unwrap()
    }

    fn completing_state(mission: &str) -> State {
        serde_json::from_value(json!({
            "headerId": 1,
            "timestamp": "2026-01-01T00:00:00Z",
            "orderId": format!("{mission}-n0"),
            "lastNodeId": format!("{mission}-n0-s2"),
            "lastNodeSequenceId": 2,
            "agvPosition": {"x": 1.0, "y": 1.0, "theta": 0.0, "mapId": "warehouse"},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_mission_completion() {
        use fleetd_store::Store as _;

        let store = MemoryStore::new();
        let external = store.external_handle();
        let (broker, states) = FakeBroker::new();
        let broker = Arc::new(broker);

        // A state message for a robot nobody knows is dropped harmlessly.
        let _ = states.send(StateMessage {
            robot: "ghost".to_string(),
            state: completing_state("nothing"),
        });

        external.create(&robot("carter01")).await.unwrap();
        external.create(&mission("m1", "carter01")).await.unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::clone(&broker),
            DispatcherConfig::default(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run());

        // Feed completion feedback until the agent exists and finishes the
        // mission; repeats are idempotent.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let _ = states.send(StateMessage {
                robot: "carter01".to_string(),
                state: completing_state("m1"),
            });
            let state = external
                .get::<MissionObject>("m1")
                .await
                .unwrap()
                .status
                .state;
            if state == MissionState::Completed {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mission never completed (state {state:?})"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(broker.order_count() >= 1);
        let robot: RobotObject = external.get("carter01").await.unwrap();
        assert!(robot.status.online);
        dispatcher_task.abort();
    }

    /// Store whose watch always fails structurally.
    #[derive(Clone)]
    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn list<T: ApiObject>(&self, _query: &T::Query) -> Result<Vec<T>, StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn get<T: ApiObject>(&self, _name: &str) -> Result<T, StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn create<T: ApiObject>(&self, _obj: &T) -> Result<(), StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn update_spec<T: ApiObject>(
            &self,
            _name: &str,
            _spec: &T::Spec,
        ) -> Result<(), StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn update_status<T: ApiObject>(
            &self,
            _name: &str,
            _status: &T::Status,
        ) -> Result<(), StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn set_lifecycle<T: ApiObject>(
            &self,
            _name: &str,
            _lifecycle: ObjectLifecycle,
        ) -> Result<(), StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn delete<T: ApiObject>(&self, _name: &str) -> Result<(), StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
        async fn watch<T: ApiObject>(&self) -> Result<WatchStream<T>, StoreError> {
            Err(StoreError::Server("schema mismatch".into()))
        }
    }

    #[tokio::test]
    async fn structural_store_failure_stops_dispatcher() {
        let (broker, _states) = FakeBroker::new();
        let dispatcher = Dispatcher::new(
            BrokenStore,
            Arc::new(broker),
            DispatcherConfig::default(),
        );
        let result = tokio::time::timeout(Duration::from_secs(2), dispatcher.run())
            .await
            .expect("dispatcher should stop");
        let err = result.unwrap_err();
        assert_eq!(err.code(), "SERVER");
    }

    #[tokio::test]
    async fn terminal_missions_are_not_routed() {
        use fleetd_store::Store as _;

        let store = MemoryStore::new();
        let external = store.external_handle();
        let (broker, _states) = FakeBroker::new();
        let broker = Arc::new(broker);

        external.create(&robot("carter01")).await.unwrap();
        let mut done = mission("m1", "carter01");
        done.status.state = MissionState::Completed;
        external.create(&done).await.unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::clone(&broker),
            DispatcherConfig::default(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.order_count(), 0);
        assert_eq!(
            external
                .get::<MissionObject>("m1")
                .await
                .unwrap()
                .status
                .state,
            MissionState::Completed
        );
        dispatcher_task.abort();
    }
}
