//! Join helpers shared by the pipeline stages.

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Waits for a stage task to finish, bounded by the deadline. Returns
/// whether the task is finished.
pub(crate) async fn stopped_within(handle: &mut JoinHandle<()>, deadline: Instant) -> bool {
    if handle.is_finished() {
        return true;
    }
    tokio::time::timeout_at(deadline, handle).await.is_ok()
}

/// Waits for a stage task to finish without a bound.
pub(crate) async fn stopped(handle: &mut JoinHandle<()>) {
    if !handle.is_finished() {
        let _ = handle.await;
    }
}
