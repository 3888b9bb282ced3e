//! In-process store with the same observable behavior as the REST-backed
//! one.  Used by the test suite and by embedded single-process deployments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use fleetd_types::ObjectLifecycle;

use crate::{ApiObject, Store, StoreError, WatchStream};

/// How many change events may queue per watcher before the slowest one
/// starts losing deltas.
const WATCH_CAPACITY: usize = 256;

#[derive(Clone)]
struct ChangeEvent {
    alias: &'static str,
    publisher: Uuid,
    payload: Arc<serde_json::Value>,
}

#[derive(Default)]
struct Tables {
    /// alias -> name -> serialized object.
    objects: BTreeMap<&'static str, BTreeMap<String, serde_json::Value>>,
}

struct Shared {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Shared in-memory store handle.
///
/// Clones share the same data *and* the same publisher id (one id per
/// logical client, as with the REST client).  Use
/// [`MemoryStore::external_handle`] to act as a different client, e.g. a
/// test standing in for the REST API user.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    publisher_id: Uuid,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                changes,
            }),
            publisher_id: Uuid::new_v4(),
        }
    }

    /// A handle onto the same data with a fresh publisher id, whose writes
    /// are therefore visible to this handle's watchers.
    pub fn external_handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            publisher_id: Uuid::new_v4(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock means a writer panicked mid-update; tests fail
        // loudly, production never panics here.
        self.shared
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, alias: &'static str, payload: serde_json::Value) {
        let _ = self.shared.changes.send(ChangeEvent {
            alias,
            publisher: self.publisher_id,
            payload: Arc::new(payload),
        });
    }

    fn mutate<T: ApiObject>(
        &self,
        name: &str,
        f: impl FnOnce(&mut serde_json::Value) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let payload = {
            let mut tables = self.lock();
            let table = tables.objects.entry(T::alias()).or_default();
            let value = table
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(format!("{} {name}", T::alias())))?;
            f(value)?;
            value.clone()
        };
        self.publish(T::alias(), payload);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list<T: ApiObject>(&self, query: &T::Query) -> Result<Vec<T>, StoreError> {
        let items: Vec<T> = {
            let mut tables = self.lock();
            tables
                .objects
                .entry(T::alias())
                .or_default()
                .values()
                .map(|value| serde_json::from_value(value.clone()))
                .collect::<Result<_, _>>()?
        };
        Ok(T::apply_query(items, query))
    }

    async fn get<T: ApiObject>(&self, name: &str) -> Result<T, StoreError> {
        let mut tables = self.lock();
        let value = tables
            .objects
            .entry(T::alias())
            .or_default()
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("{} {name}", T::alias())))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn create<T: ApiObject>(&self, obj: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_value(obj)?;
        {
            let mut tables = self.lock();
            let table = tables.objects.entry(T::alias()).or_default();
            if table.contains_key(obj.name()) {
                return Err(StoreError::Usage(format!(
                    "{} {} already exists",
                    T::alias(),
                    obj.name()
                )));
            }
            table.insert(obj.name().to_string(), payload.clone());
        }
        self.publish(T::alias(), payload);
        Ok(())
    }

    async fn update_spec<T: ApiObject>(
        &self,
        name: &str,
        spec: &T::Spec,
    ) -> Result<(), StoreError> {
        let spec = serde_json::to_value(spec)?;
        self.mutate::<T>(name, |value| {
            value["spec"] = spec;
            Ok(())
        })
    }

    async fn update_status<T: ApiObject>(
        &self,
        name: &str,
        status: &T::Status,
    ) -> Result<(), StoreError> {
        let status = serde_json::to_value(status)?;
        self.mutate::<T>(name, |value| {
            value["status"] = status;
            Ok(())
        })
    }

    async fn set_lifecycle<T: ApiObject>(
        &self,
        name: &str,
        lifecycle: ObjectLifecycle,
    ) -> Result<(), StoreError> {
        let lifecycle = serde_json::to_value(lifecycle)?;
        self.mutate::<T>(name, |value| {
            value["lifecycle"] = lifecycle;
            Ok(())
        })
    }

    async fn delete<T: ApiObject>(&self, name: &str) -> Result<(), StoreError> {
        let payload = {
            let mut tables = self.lock();
            let table = tables.objects.entry(T::alias()).or_default();
            let mut value = table
                .remove(name)
                .ok_or_else(|| StoreError::NotFound(format!("{} {name}", T::alias())))?;
            value["lifecycle"] = serde_json::to_value(ObjectLifecycle::Deleted)?;
            value
        };
        self.publish(T::alias(), payload);
        Ok(())
    }

    async fn watch<T: ApiObject>(&self) -> Result<WatchStream<T>, StoreError> {
        // Snapshot and subscription under one lock so no delta falls in the
        // gap between them.
        let (snapshot, rx) = {
            let mut tables = self.lock();
            let snapshot: Vec<serde_json::Value> = tables
                .objects
                .entry(T::alias())
                .or_default()
                .values()
                .cloned()
                .collect();
            (snapshot, self.shared.changes.subscribe())
        };

        let own_id = self.publisher_id;
        let deltas = BroadcastStream::new(rx).filter_map(move |event| {
            let item = match event {
                Ok(event) if event.alias == T::alias() && event.publisher != own_id => Some(
                    serde_json::from_value::<T>((*event.payload).clone()).map_err(StoreError::from),
                ),
                Ok(_) => None,
                Err(err) => Some(Err(StoreError::Server(format!(
                    "watch stream lagged: {err}"
                )))),
            };
            futures_util::future::ready(item)
        });

        let initial = futures_util::stream::iter(
            snapshot
                .into_iter()
                .map(|value| serde_json::from_value::<T>(value).map_err(StoreError::from)),
        );
        Ok(initial.chain(deltas).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_types::mission::{MissionNode, MissionNodeKind, RouteNode};
    use fleetd_types::{
        MissionObject, MissionSpec, MissionState, Pose2D, RobotObject, RobotSpec,
    };
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

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

    async fn next<T: ApiObject>(stream: &mut WatchStream<T>) -> T {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("watch delivery timed out")
            .expect("watch stream ended")
            .expect("watch stream errored")
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let store = MemoryStore::new();
        store.create(&robot("carter01")).await.unwrap();
        let back: RobotObject = store.get("carter01").await.unwrap();
        assert_eq!(back.name, "carter01");
    }

    #[tokio::test]
    async fn create_duplicate_is_usage_error() {
        let store = MemoryStore::new();
        store.create(&robot("carter01")).await.unwrap();
        let err = store.create(&robot("carter01")).await.unwrap_err();
        assert!(matches!(err, StoreError::Usage(_)));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get::<RobotObject>("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_status_persists() {
        let store = MemoryStore::new();
        let mission = mission("m1", "carter01");
        store.create(&mission).await.unwrap();
        let mut status = mission.status.clone();
        status.state = MissionState::Running;
        store
            .update_status::<MissionObject>("m1", &status)
            .await
            .unwrap();
        let back: MissionObject = store.get("m1").await.unwrap();
        assert_eq!(back.status.state, MissionState::Running);
    }

    #[tokio::test]
    async fn watch_yields_snapshot_then_deltas() {
        let store = MemoryStore::new();
        let external = store.external_handle();
        external.create(&robot("early")).await.unwrap();

        let mut stream = store.watch::<RobotObject>().await.unwrap();
        assert_eq!(next(&mut stream).await.name, "early");

        external.create(&robot("late")).await.unwrap();
        assert_eq!(next(&mut stream).await.name, "late");
    }

    #[tokio::test]
    async fn watch_suppresses_own_writes() {
        let store = MemoryStore::new();
        let external = store.external_handle();
        let mut stream = store.watch::<RobotObject>().await.unwrap();

        // Write through the watching handle, then through another client.
        store.create(&robot("own")).await.unwrap();
        external.create(&robot("other")).await.unwrap();

        // Only the external write is delivered.
        assert_eq!(next(&mut stream).await.name, "other");
    }

    #[tokio::test]
    async fn watch_streams_are_per_kind() {
        let store = MemoryStore::new();
        let external = store.external_handle();
        let mut robots = store.watch::<RobotObject>().await.unwrap();

        external.create(&mission("m1", "carter01")).await.unwrap();
        external.create(&robot("carter01")).await.unwrap();

        assert_eq!(next(&mut robots).await.name, "carter01");
    }

    #[tokio::test]
    async fn delete_streams_deleted_lifecycle() {
        let store = MemoryStore::new();
        let external = store.external_handle();
        external.create(&robot("carter01")).await.unwrap();

        let mut stream = store.watch::<RobotObject>().await.unwrap();
        let _snapshot = next(&mut stream).await;

        external.delete::<RobotObject>("carter01").await.unwrap();
        let deleted = next(&mut stream).await;
        assert_eq!(deleted.lifecycle, ObjectLifecycle::Deleted);
        assert!(matches!(
            store.get::<RobotObject>("carter01").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn set_lifecycle_marks_pending_delete() {
        let store = MemoryStore::new();
        store.create(&robot("carter01")).await.unwrap();
        store
            .set_lifecycle::<RobotObject>("carter01", ObjectLifecycle::PendingDelete)
            .await
            .unwrap();
        let back: RobotObject = store.get("carter01").await.unwrap();
        assert_eq!(back.lifecycle, ObjectLifecycle::PendingDelete);
    }

    #[tokio::test]
    async fn list_applies_query() {
        let store = MemoryStore::new();
        store.create(&mission("m1", "a")).await.unwrap();
        store.create(&mission("m2", "b")).await.unwrap();
        let query = fleetd_types::MissionQueryParams {
            robot: Some("b".to_string()),
            ..Default::default()
        };
        let missions: Vec<MissionObject> = store.list(&query).await.unwrap();
        assert_eq!(missions.len(), 1);
        assert_eq!(missions[0].name, "m2");
    }
}
