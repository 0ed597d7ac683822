pub mod coordinator;
pub mod recorder;

pub use coordinator::{CoordinatorConfig, SegmentArtifact, SegmentCoordinator, SegmentOutcome};
pub use recorder::{RecordError, RecordOutcome, RecorderConfig, StreamRecorder};

use tokio::sync::watch;

/// Resolves once the stop flag is raised; never resolves if the sender is
/// gone (callers bound the wait through other select arms).
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
