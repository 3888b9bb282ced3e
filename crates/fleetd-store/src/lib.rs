//! The store port: the abstract interface through which agents and the
//! dispatcher read, write, and watch persisted objects.
//!
//! Two implementations are provided:
//!
//! * [`HttpStore`] – a client for the mission-database REST API (the
//!   production path).  `watch` consumes a line-delimited JSON stream.
//! * [`MemoryStore`] – an in-process store with the same observable
//!   behavior, used by tests and embedded deployments.
//!
//! Both honor the watch contract: subscribing first yields the current set
//! of objects, then every subsequent change as a delta.  Writes carry the
//! caller's `publisher_id`; a watcher never sees its own writes echoed back.

pub mod http;
pub mod memory;
mod objects;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use fleetd_types::{DispatchError, ObjectLifecycle};

pub use http::HttpStore;
pub use memory::MemoryStore;

/// Stream of watch deliveries for one object kind.
pub type WatchStream<T> = BoxStream<'static, Result<T, StoreError>>;

/// Store access failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The caller did something invalid (4xx from the database API).
    #[error("usage error: {0}")]
    Usage(String),
    /// The database API failed internally (5xx) or violated its contract.
    #[error("server error: {0}")]
    Server(String),
    /// Connection-level failure; retrying may succeed.
    #[error("transient error: {0}")]
    Transient(String),
    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transient(err.to_string())
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Usage(msg) | StoreError::NotFound(msg) => DispatchError::Usage(msg),
            StoreError::Server(msg) => DispatchError::Server(msg),
            StoreError::Transient(msg) => DispatchError::Transient(msg),
            StoreError::Decode(err) => DispatchError::Server(err.to_string()),
        }
    }
}

/// A persisted object kind: a named spec/status pair with a lifecycle.
pub trait ApiObject:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type Spec: Clone + Send + Sync + Serialize + DeserializeOwned;
    type Status: Clone + Send + Sync + Serialize + DeserializeOwned;
    type Query: Default + Send + Sync + Serialize;

    /// The path segment this kind lives under (`"robot"`, `"mission"`).
    fn alias() -> &'static str;
    fn name(&self) -> &str;
    fn lifecycle(&self) -> ObjectLifecycle;
    fn set_lifecycle(&mut self, lifecycle: ObjectLifecycle);
    fn spec(&self) -> &Self::Spec;
    fn set_spec(&mut self, spec: Self::Spec);
    fn status(&self) -> &Self::Status;
    fn set_status(&mut self, status: Self::Status);

    /// Apply list-endpoint query filters to an in-memory result set.
    fn apply_query(items: Vec<Self>, query: &Self::Query) -> Vec<Self>;
}

/// The store port used by the dispatcher and every robot agent.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn list<T: ApiObject>(&self, query: &T::Query) -> Result<Vec<T>, StoreError>;

    async fn get<T: ApiObject>(&self, name: &str) -> Result<T, StoreError>;

    async fn create<T: ApiObject>(&self, obj: &T) -> Result<(), StoreError>;

    async fn update_spec<T: ApiObject>(
        &self,
        name: &str,
        spec: &T::Spec,
    ) -> Result<(), StoreError>;

    async fn update_status<T: ApiObject>(
        &self,
        name: &str,
        status: &T::Status,
    ) -> Result<(), StoreError>;

    async fn set_lifecycle<T: ApiObject>(
        &self,
        name: &str,
        lifecycle: ObjectLifecycle,
    ) -> Result<(), StoreError>;

    async fn delete<T: ApiObject>(&self, name: &str) -> Result<(), StoreError>;

    /// Watch for changes: the current set of objects first, then deltas.
    /// Writes made through this handle are suppressed from the stream.
    async fn watch<T: ApiObject>(&self) -> Result<WatchStream<T>, StoreError>;
}
