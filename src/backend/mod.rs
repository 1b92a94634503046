//! Client side of the external state service.
//!
//! The orchestrator talks to the backend through two narrow traits so runs can
//! be driven against a fake in tests:
//! - [`ProgressStore`] reads and writes the per-device resume cursor
//! - [`ArtifactUploader`] pushes stage logs and telemetry files
//!
//! Neither trait surfaces errors to the caller. Progress lookups fail safe to
//! the earliest stage and writes/uploads report a plain `bool`; every failure
//! is logged where it happens.

pub mod client;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::stage::StageName;

pub use client::BackendClient;

/// One file to upload: form field name and local path.
pub type ArtifactFile = (String, PathBuf);

/// Per-device resume cursor.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Stage to resume from. Never fails: any error yields [`StageName::EARLIEST`].
    async fn get_progress(&self, device_id: &str) -> StageName;

    /// Best-effort write; `false` means the backend did not acknowledge it.
    async fn set_progress(&self, device_id: &str, stage: StageName) -> bool;
}

/// Artifact ingestion.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Upload `files` for `stage` in one request. Missing files are skipped.
    async fn upload_artifacts(&self, device_id: &str, stage: StageName, files: &[ArtifactFile])
        -> bool;
}

/// Stand-in used when no backend URL is configured.
///
/// Runs always start from the first stage and nothing is reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineBackend;

#[async_trait]
impl ProgressStore for OfflineBackend {
    async fn get_progress(&self, device_id: &str) -> StageName {
        tracing::warn!(device = %device_id, "No backend configured; starting from the first stage");
        StageName::EARLIEST
    }

    async fn set_progress(&self, device_id: &str, stage: StageName) -> bool {
        tracing::debug!(device = %device_id, stage = %stage, "No backend configured; progress not reported");
        false
    }
}

#[async_trait]
impl ArtifactUploader for OfflineBackend {
    async fn upload_artifacts(
        &self,
        device_id: &str,
        stage: StageName,
        files: &[ArtifactFile],
    ) -> bool {
        tracing::debug!(
            device = %device_id,
            stage = %stage,
            files = files.len(),
            "No backend configured; upload skipped"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_backend_fails_safe() {
        let backend = OfflineBackend;
        assert_eq!(backend.get_progress("truffle-0001").await, StageName::Setup);
        assert!(!backend.set_progress("truffle-0001", StageName::Gpu).await);
        assert!(
            !backend
                .upload_artifacts("truffle-0001", StageName::Led, &[])
                .await
        );
    }
}
