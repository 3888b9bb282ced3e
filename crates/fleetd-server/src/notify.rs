//! Executor for `notify` mission leaves.
//!
//! A notify leaf is handled entirely server-side: POST the configured JSON
//! payload to the given URL with the leaf's timeout, retrying transient
//! statuses a bounded number of times.

use fleetd_types::mission::NotifyNode;
use fleetd_types::MissionState;
use tracing::info;

/// HTTP statuses worth retrying.
const RETRYABLE: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Retries after the first attempt (4 attempts total).
const MAX_RETRIES: u32 = 3;

/// Run the notify call and return the resulting leaf state: any 2xx is
/// COMPLETED, a retryable status is attempted up to [`MAX_RETRIES`] more
/// times, anything else is FAILED.  Connection-level errors count as
/// retryable.
pub async fn execute(client: &reqwest::Client, node: &NotifyNode) -> MissionState {
    let mut retries = 0;
    loop {
        let response = client
            .post(&node.url)
            .json(&node.json_data)
            .timeout(node.timeout)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                return MissionState::Completed;
            }
            Ok(response) if RETRYABLE.contains(&response.status().as_u16()) => {
                info!(url = %node.url, status = %response.status(), "notify: retrying");
            }
            Ok(response) => {
                info!(url = %node.url, status = %response.status(), "notify: failed");
                return MissionState::Failed;
            }
            Err(err) => {
                info!(url = %node.url, error = %err, "notify: request error, retrying");
            }
        }
        retries += 1;
        if retries > MAX_RETRIES {
            return MissionState::Failed;
        }
    }
}
