//! Best-effort side calls to an external mission-control service.
//!
//! Used for map deployment and for requesting charging missions when a
//! robot's battery drops below its recommended minimum.  Every call here is
//! advisory: failures are logged and otherwise ignored.

use tracing::{debug, warn};

/// Client for the mission-control REST API.
#[derive(Clone)]
pub struct MissionControl {
    base_url: String,
    client: reqwest::Client,
}

impl MissionControl {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Whether the service answers its health endpoint.
    pub async fn healthy(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/v1/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(error = %err, "mission control unreachable");
                false
            }
        }
    }

    /// Ask mission control to push a map to the robot.  Returns whether the
    /// request was accepted.
    pub async fn push_map(&self, robot: &str) -> bool {
        self.post("/api/v1/push_map", robot, "map deployment").await
    }

    /// Ask mission control to enqueue a charging mission for the robot.
    pub async fn request_charging(&self, robot: &str) -> bool {
        self.post("/api/v1/mission/charging", robot, "charging mission")
            .await
    }

    async fn post(&self, path: &str, robot: &str, what: &str) -> bool {
        let result = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .query(&[("robot_name", robot)])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(robot = %robot, "{what} request posted");
                true
            }
            Ok(response) => {
                warn!(robot = %robot, status = %response.status(), "failed to post {what} request");
                false
            }
            Err(err) => {
                warn!(robot = %robot, error = %err, "failed to post {what} request");
                false
            }
        }
    }
}
