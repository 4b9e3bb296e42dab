//! Test support shared by unit and integration tests.

pub mod mock_upstream;
pub mod unreachable_store;

pub use mock_upstream::ScriptedUpstream;
pub use unreachable_store::UnreachableStore;

use std::future::Future;
use std::time::Duration;

/// Polls `condition` until it holds, panicking after two seconds.
///
/// Background drains run on spawned tasks, so tests wait for their effects
/// instead of sleeping a fixed amount.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Gives spawned tasks `duration` to make progress.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}
