//! Request builders and waiting helpers.

use std::future::Future;
use std::time::Duration;

use ferry_core::{LocalUser, TransferRequest};

/// Unprivileged user used by fixtures.
#[must_use]
pub fn test_user() -> LocalUser {
    LocalUser::new("tester", 1000, 1000).with_home("/home/tester")
}

/// Request for `job_id` reading `source` through the scripted mover.
#[must_use]
pub fn mock_request(job_id: &str, source: &str) -> TransferRequest {
    let name = source.rsplit('/').next().unwrap_or("out");
    TransferRequest::new(
        job_id,
        source,
        format!("mock://destination/{job_id}/{name}"),
        test_user(),
    )
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
