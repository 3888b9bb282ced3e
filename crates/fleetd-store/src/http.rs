//! Client for the mission-database REST API.
//!
//! Object kinds live under `/{alias}`; the watch endpoint streams
//! line-delimited JSON from `/{alias}/watch`.  Every write carries this
//! client's `publisher_id` so the database can suppress the echo on this
//! client's own watch streams.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use fleetd_types::ObjectLifecycle;

use crate::{ApiObject, Store, StoreError, WatchStream};

/// REST-backed store client.
#[derive(Clone)]
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
    publisher_id: Uuid,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
            publisher_id: Uuid::new_v4(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Whether the database API answers its health endpoint.
    pub async fn is_running(&self) -> bool {
        match self.client.get(self.url("health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn handle_response(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(StoreError::NotFound(text))
        } else if status.is_client_error() {
            Err(StoreError::Usage(text))
        } else {
            Err(StoreError::Server(format!("{status}: {text}")))
        }
    }

    /// Flatten a query-params struct into URL pairs, joining list values with
    /// commas (the form the database API expects).
    fn query_pairs(query: &impl Serialize) -> Result<Vec<(String, String)>, StoreError> {
        let value = serde_json::to_value(query)?;
        let serde_json::Value::Object(map) = value else {
            return Ok(Vec::new());
        };
        Ok(map
            .into_iter()
            .map(|(key, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Array(items) => items
                        .into_iter()
                        .map(|item| match item {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(","),
                    other => other.to_string(),
                };
                (key, rendered)
            })
            .collect())
    }
}

/// Split a chunked byte stream into parsed JSON lines.
fn json_lines<T, S>(byte_stream: S) -> impl Stream<Item = Result<T, StoreError>> + Send
where
    T: ApiObject,
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (byte_stream, BytesMut::new()),
        |(mut byte_stream, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    let item = serde_json::from_slice::<T>(line).map_err(StoreError::from);
                    return Some((item, (byte_stream, buffer)));
                }
                match byte_stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        return Some((
                            Err(StoreError::Transient(err.to_string())),
                            (byte_stream, buffer),
                        ));
                    }
                    // Connection closed; the consumer reconnects.
                    None => return None,
                }
            }
        },
    )
}

#[async_trait]
impl Store for HttpStore {
    async fn list<T: ApiObject>(&self, query: &T::Query) -> Result<Vec<T>, StoreError> {
        let response = self
            .client
            .get(self.url(T::alias()))
            .query(&Self::query_pairs(query)?)
            .send()
            .await?;
        Ok(Self::handle_response(response).await?.json().await?)
    }

    async fn get<T: ApiObject>(&self, name: &str) -> Result<T, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("{}/{name}", T::alias())))
            .send()
            .await?;
        Ok(Self::handle_response(response).await?.json().await?)
    }

    async fn create<T: ApiObject>(&self, obj: &T) -> Result<(), StoreError> {
        let mut body = serde_json::to_value(obj.spec())?;
        body["name"] = serde_json::Value::String(obj.name().to_string());
        let response = self
            .client
            .post(self.url(T::alias()))
            .query(&[("publisher_id", self.publisher_id.to_string())])
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await.map(|_| ())
    }

    async fn update_spec<T: ApiObject>(
        &self,
        name: &str,
        spec: &T::Spec,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url(&format!("{}/{name}", T::alias())))
            .query(&[("publisher_id", self.publisher_id.to_string())])
            .json(spec)
            .send()
            .await?;
        Self::handle_response(response).await.map(|_| ())
    }

    async fn update_status<T: ApiObject>(
        &self,
        name: &str,
        status: &T::Status,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url(&format!("{}/{name}", T::alias())))
            .query(&[("publisher_id", self.publisher_id.to_string())])
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;
        Self::handle_response(response).await.map(|_| ())
    }

    async fn set_lifecycle<T: ApiObject>(
        &self,
        name: &str,
        lifecycle: ObjectLifecycle,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url(&format!("{}/{name}", T::alias())))
            .query(&[("publisher_id", self.publisher_id.to_string())])
            .json(&serde_json::json!({ "lifecycle": lifecycle }))
            .send()
            .await?;
        Self::handle_response(response).await.map(|_| ())
    }

    async fn delete<T: ApiObject>(&self, name: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.url(&format!("{}/{name}", T::alias())))
            .send()
            .await?;
        Self::handle_response(response).await.map(|_| ())
    }

    async fn watch<T: ApiObject>(&self) -> Result<WatchStream<T>, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("{}/watch", T::alias())))
            .query(&[("publisher_id", self.publisher_id.to_string())])
            .send()
            .await?;
        let response = Self::handle_response(response).await?;
        Ok(json_lines(response.bytes_stream().boxed()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_types::{RobotObject, RobotQueryParams, RobotSpec};
    use futures_util::StreamExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn robot(name: &str) -> RobotObject {
        RobotObject::new(name, RobotSpec::default())
    }

    #[tokio::test]
    async fn list_deserializes_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![robot("carter01")]))
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        let robots: Vec<RobotObject> = store.list(&RobotQueryParams::default()).await.unwrap();
        assert_eq!(robots.len(), 1);
        assert_eq!(robots[0].name, "carter01");
    }

    #[tokio::test]
    async fn list_joins_name_filters_with_commas() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robot"))
            .and(query_param("names", "a,b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<RobotObject>::new()))
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        let query = RobotQueryParams {
            names: Some(vec!["a".to_string(), "b".to_string()]),
            ..Default::default()
        };
        let robots: Vec<RobotObject> = store.list(&query).await.unwrap();
        assert!(robots.is_empty());
    }

    #[tokio::test]
    async fn create_posts_spec_with_name_and_publisher() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/robot"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        store.create(&robot("carter01")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["name"], "carter01");
        assert!(body.get("heartbeat_timeout").is_some());
        assert!(requests[0].url.query().unwrap().contains("publisher_id="));
    }

    #[tokio::test]
    async fn client_errors_map_to_usage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mission/ghost"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        let err = store
            .get::<fleetd_types::MissionObject>("ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Usage(_)));
    }

    #[tokio::test]
    async fn missing_objects_map_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robot/ghost"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such robot"))
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        let err = store.get::<RobotObject>("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_errors_map_to_server() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/robot/carter01"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        let err = store.delete::<RobotObject>("carter01").await.unwrap_err();
        assert!(matches!(err, StoreError::Server(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let store = HttpStore::new("http://127.0.0.1:1");
        let err = store.get::<RobotObject>("carter01").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn watch_parses_line_delimited_objects() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}\n",
            serde_json::to_string(&robot("a")).unwrap(),
            serde_json::to_string(&robot("b")).unwrap()
        );
        Mock::given(method("GET"))
            .and(path("/robot/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let store = HttpStore::new(server.uri());
        let mut stream = store.watch::<RobotObject>().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().name, "a");
        assert_eq!(stream.next().await.unwrap().unwrap().name, "b");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let store = HttpStore::new("http://localhost:5000/");
        assert_eq!(store.base_url(), "http://localhost:5000");
    }
}
