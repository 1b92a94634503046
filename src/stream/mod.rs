//! Periodic artifact streaming for long-running stages.
//!
//! While a stage runs, a background task re-uploads its log (and any extra
//! artifact) on a fixed cadence so partial results are visible to the backend.
//! Files are sent whole on every tick whether or not they changed.
//!
//! [`StreamHandle::stop`] ends the cadence and performs exactly one final
//! upload, so output written after the last tick is never lost. Upload
//! failures are logged and never affect the stage result.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::backend::{ArtifactFile, ArtifactUploader};
use crate::stage::StageName;
use crate::ui::RunUI;

/// Starts streamers for individual stages.
#[derive(Clone)]
pub struct ArtifactStreamer {
    uploader: Arc<dyn ArtifactUploader>,
    interval: Duration,
    ui: Option<Arc<RunUI>>,
}

impl ArtifactStreamer {
    pub fn new(uploader: Arc<dyn ArtifactUploader>, interval: Duration) -> Self {
        Self {
            uploader,
            interval,
            ui: None,
        }
    }

    /// Report each periodic upload on the console.
    pub fn with_ui(mut self, ui: Arc<RunUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Begin streaming `files` for `stage`.
    ///
    /// The first upload happens one full interval after start.
    pub fn start(&self, device_id: &str, stage: StageName, files: Vec<ArtifactFile>) -> StreamHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(periodic_uploads(
            self.uploader.clone(),
            device_id.to_string(),
            stage,
            files.clone(),
            self.interval,
            self.ui.clone(),
            cancel.clone(),
        ));

        info!(
            device = %device_id,
            stage = %stage,
            interval_secs = self.interval.as_secs(),
            "Streaming artifacts"
        );

        StreamHandle {
            uploader: self.uploader.clone(),
            device_id: device_id.to_string(),
            stage,
            files,
            task,
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }
}

async fn periodic_uploads(
    uploader: Arc<dyn ArtifactUploader>,
    device_id: String,
    stage: StageName,
    files: Vec<ArtifactFile>,
    period: Duration,
    ui: Option<Arc<RunUI>>,
    cancel: CancellationToken,
) -> (usize, usize) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    let mut attempts = 0;
    let mut failures = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                attempts += 1;
                let ok = uploader.upload_artifacts(&device_id, stage, &files).await;
                if ok {
                    info!(stage = %stage, attempt = attempts, "Periodic artifact upload");
                } else {
                    failures += 1;
                    warn!(stage = %stage, attempt = attempts, "Periodic upload did not go through");
                }
                if let Some(ui) = &ui {
                    ui.upload_result(stage.as_str(), ok);
                }
            }
        }
    }
    (attempts, failures)
}

/// What a streamer did over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    /// Periodic upload attempts made before `stop`.
    pub periodic_uploads: usize,
    /// How many of those were not acknowledged.
    pub failed_uploads: usize,
    /// Whether the final upload was acknowledged.
    pub final_upload_ok: bool,
}

/// A running streamer. Dropping it without `stop` cancels the cadence
/// without a final upload.
pub struct StreamHandle {
    uploader: Arc<dyn ArtifactUploader>,
    device_id: String,
    stage: StageName,
    files: Vec<ArtifactFile>,
    task: JoinHandle<(usize, usize)>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl StreamHandle {
    /// Stop the cadence, then upload once more.
    pub async fn stop(self) -> StreamReport {
        self.cancel.cancel();
        let (periodic_uploads, failed_uploads) = match self.task.await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "Streaming task ended abnormally");
                (0, 0)
            }
        };

        let final_upload_ok = self
            .uploader
            .upload_artifacts(&self.device_id, self.stage, &self.files)
            .await;
        if final_upload_ok {
            info!(stage = %self.stage, periodic_uploads, "Final artifact upload complete");
        } else {
            warn!(stage = %self.stage, "Final artifact upload failed");
        }

        StreamReport {
            periodic_uploads,
            failed_uploads,
            final_upload_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingUploader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ArtifactUploader for CountingUploader {
        async fn upload_artifacts(&self, _: &str, _: StageName, _: &[ArtifactFile]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            !self.fail
        }
    }

    fn files() -> Vec<ArtifactFile> {
        vec![("gpuTestFile".to_string(), PathBuf::from("/tmp/burn_test.txt"))]
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick_uploads_once() {
        let uploader = Arc::new(CountingUploader::default());
        let streamer = ArtifactStreamer::new(uploader.clone(), Duration::from_secs(10));

        let handle = streamer.start("truffle-0001", StageName::Gpu, files());
        tokio::time::sleep(Duration::from_secs(3)).await;
        let report = handle.stop().await;

        assert_eq!(report.periodic_uploads, 0);
        assert!(report.final_upload_ok);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_uploads_then_one_final() {
        let uploader = Arc::new(CountingUploader::default());
        let streamer = ArtifactStreamer::new(uploader.clone(), Duration::from_secs(10));

        let handle = streamer.start("truffle-0001", StageName::Led, files());
        tokio::time::sleep(Duration::from_secs(35)).await;
        let report = handle.stop().await;

        assert_eq!(report.periodic_uploads, 3);
        assert_eq!(report.failed_uploads, 0);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_uploads_keep_the_cadence() {
        let uploader = Arc::new(CountingUploader {
            fail: true,
            ..Default::default()
        });
        let streamer = ArtifactStreamer::new(uploader.clone(), Duration::from_secs(10))
            .with_ui(Arc::new(RunUI::new(false)));

        let handle = streamer.start("truffle-0001", StageName::Gpu, files());
        tokio::time::sleep(Duration::from_secs(25)).await;
        let report = handle.stop().await;

        assert_eq!(report.periodic_uploads, 2);
        assert_eq!(report.failed_uploads, 2);
        assert!(!report.final_upload_ok);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_cadence() {
        let uploader = Arc::new(CountingUploader::default());
        let streamer = ArtifactStreamer::new(uploader.clone(), Duration::from_secs(10));

        drop(streamer.start("truffle-0001", StageName::Led, files()));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }
}
