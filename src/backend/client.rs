//! HTTP client for the backend state service.
//!
//! Wire contract:
//! - `GET  {base}/{device_id}` returns `{"stage": "<stage name>"}`
//! - `POST {base}/upload` takes a multipart form with `name=<device_id>`,
//!   optional `stage=<stage name>` and zero or more file fields
//!
//! A progress write is an upload with no file fields. HTTP 200 is the only
//! status treated as success.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ArtifactFile, ArtifactUploader, ProgressStore};
use crate::errors::BackendError;
use crate::stage::StageName;

#[derive(Debug, Deserialize)]
struct ProgressPayload {
    #[serde(default)]
    stage: Option<String>,
}

/// reqwest-backed client; cheap to clone.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    /// Create a client whose every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(BackendError::Unavailable)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn progress_url(&self, device_id: &str) -> String {
        format!("{}/{}", self.base_url, device_id)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload", self.base_url)
    }

    /// Fetch the stored stage for `device_id`.
    ///
    /// `Ok(None)` means the backend answered but had no usable stage.
    pub async fn fetch_progress(&self, device_id: &str) -> Result<Option<StageName>, BackendError> {
        let resp = self
            .http
            .get(self.progress_url(device_id))
            .send()
            .await
            .map_err(BackendError::Unavailable)?;

        if resp.status() != StatusCode::OK {
            return Err(BackendError::UnexpectedStatus {
                status: resp.status().as_u16(),
            });
        }

        let body = resp.text().await.map_err(BackendError::Unavailable)?;
        let payload: ProgressPayload = serde_json::from_str(&body)
            .map_err(|e| BackendError::UnexpectedPayload(e.to_string()))?;

        match payload.stage {
            None => Ok(None),
            Some(raw) => raw
                .parse::<StageName>()
                .map(Some)
                .map_err(|_| BackendError::UnexpectedPayload(format!("unknown stage '{}'", raw))),
        }
    }

    /// Post a multipart form to the upload endpoint.
    async fn post_form(&self, form: Form, label: &str) -> Result<(), BackendError> {
        let resp = self
            .http
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendError::UploadFailure {
                field: label.to_string(),
                message: e.to_string(),
            })?;

        if resp.status() != StatusCode::OK {
            return Err(BackendError::UnexpectedStatus {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Record `stage` as the resume point for `device_id`.
    pub async fn push_progress(&self, device_id: &str, stage: StageName) -> Result<(), BackendError> {
        let form = Form::new()
            .text("name", device_id.to_string())
            .text("stage", stage.to_string());
        self.post_form(form, "stage").await
    }

    /// Upload one file under `field`.
    pub async fn upload_artifact(
        &self,
        device_id: &str,
        field: &str,
        path: &std::path::Path,
        stage: Option<StageName>,
    ) -> Result<(), BackendError> {
        let files = [(field.to_string(), path.to_path_buf())];
        let uploaded = self.push_artifacts(device_id, stage, &files).await?;
        if uploaded == 0 {
            return Err(BackendError::Artifact {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            });
        }
        Ok(())
    }

    /// Upload every existing file in `files` in a single request.
    ///
    /// Returns how many files were attached; nothing is sent when none exist.
    pub async fn push_artifacts(
        &self,
        device_id: &str,
        stage: Option<StageName>,
        files: &[ArtifactFile],
    ) -> Result<usize, BackendError> {
        let mut form = Form::new().text("name", device_id.to_string());
        if let Some(stage) = stage {
            form = form.text("stage", stage.to_string());
        }

        let mut attached = 0;
        let mut fields = Vec::new();
        for (field, path) in files {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Artifact not created yet, skipping");
                    continue;
                }
                Err(source) => {
                    return Err(BackendError::Artifact {
                        path: path.clone(),
                        source,
                    });
                }
            };
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| field.clone());
            form = form.part(field.clone(), Part::bytes(bytes).file_name(file_name));
            fields.push(field.as_str());
            attached += 1;
        }

        if attached == 0 {
            return Ok(0);
        }

        self.post_form(form, &fields.join(",")).await?;
        Ok(attached)
    }
}

#[async_trait]
impl ProgressStore for BackendClient {
    async fn get_progress(&self, device_id: &str) -> StageName {
        match self.fetch_progress(device_id).await {
            Ok(Some(stage)) => {
                info!(device = %device_id, stage = %stage, "Resume point from backend");
                stage
            }
            Ok(None) => {
                info!(device = %device_id, "No stored progress; starting from the first stage");
                StageName::EARLIEST
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "Could not read progress; starting from the first stage");
                StageName::EARLIEST
            }
        }
    }

    async fn set_progress(&self, device_id: &str, stage: StageName) -> bool {
        match self.push_progress(device_id, stage).await {
            Ok(()) => {
                debug!(device = %device_id, stage = %stage, "Progress reported");
                true
            }
            Err(e) => {
                warn!(device = %device_id, stage = %stage, error = %e, "Failed to report progress");
                false
            }
        }
    }
}

#[async_trait]
impl ArtifactUploader for BackendClient {
    async fn upload_artifacts(
        &self,
        device_id: &str,
        stage: StageName,
        files: &[ArtifactFile],
    ) -> bool {
        match self.push_artifacts(device_id, Some(stage), files).await {
            Ok(0) => {
                debug!(device = %device_id, stage = %stage, "No artifacts on disk yet");
                false
            }
            Ok(n) => {
                debug!(device = %device_id, stage = %stage, files = n, "Artifacts uploaded");
                true
            }
            Err(e) => {
                warn!(device = %device_id, stage = %stage, error = %e, "Artifact upload failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Multipart, Path as AxumPath, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Debug, Default)]
    struct Recorded {
        /// Each request: text fields and file fields (name, bytes).
        requests: Vec<(Vec<(String, String)>, Vec<(String, Vec<u8>)>)>,
    }

    #[derive(Clone)]
    struct FakeState {
        progress_body: &'static str,
        upload_status: AxumStatus,
        recorded: Arc<Mutex<Recorded>>,
    }

    async fn progress(
        State(state): State<FakeState>,
        AxumPath(_device): AxumPath<String>,
    ) -> (AxumStatus, String) {
        (AxumStatus::OK, state.progress_body.to_string())
    }

    async fn upload(State(state): State<FakeState>, mut multipart: Multipart) -> AxumStatus {
        let mut texts = Vec::new();
        let mut files = Vec::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            let is_file = field.file_name().is_some();
            let data = field.bytes().await.unwrap().to_vec();
            if is_file {
                files.push((name, data));
            } else {
                texts.push((name, String::from_utf8(data).unwrap()));
            }
        }
        state.recorded.lock().unwrap().requests.push((texts, files));
        state.upload_status
    }

    async fn spawn_backend(
        progress_body: &'static str,
        upload_status: AxumStatus,
    ) -> (String, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let state = FakeState {
            progress_body,
            upload_status,
            recorded: recorded.clone(),
        };
        let app = Router::new()
            .route("/upload", post(upload))
            .route("/{device}", get(progress))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), recorded)
    }

    fn client(base: &str) -> BackendClient {
        BackendClient::new(base, Duration::from_secs(5)).unwrap()
    }

    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_get_progress_reads_stage() {
        let (base, _) = spawn_backend(r#"{"stage": "nvme"}"#, AxumStatus::OK).await;
        assert_eq!(client(&base).get_progress("truffle-0001").await, StageName::Nvme);
    }

    #[tokio::test]
    async fn test_get_progress_defaults_on_missing_stage() {
        let (base, _) = spawn_backend(r#"{"device": "truffle-0001"}"#, AxumStatus::OK).await;
        assert_eq!(client(&base).get_progress("truffle-0001").await, StageName::Setup);
    }

    #[tokio::test]
    async fn test_get_progress_defaults_on_garbage() {
        let (base, _) = spawn_backend("not json", AxumStatus::OK).await;
        assert_eq!(client(&base).get_progress("truffle-0001").await, StageName::Setup);

        let (base, _) = spawn_backend(r#"{"stage": "stage7"}"#, AxumStatus::OK).await;
        assert_eq!(client(&base).get_progress("truffle-0001").await, StageName::Setup);
    }

    #[tokio::test]
    async fn test_get_progress_defaults_when_unreachable() {
        let base = closed_port_url().await;
        assert_eq!(client(&base).get_progress("truffle-0001").await, StageName::Setup);
    }

    #[tokio::test]
    async fn test_set_progress_posts_name_and_stage() {
        let (base, recorded) = spawn_backend("{}", AxumStatus::OK).await;
        assert!(client(&base).set_progress("truffle-0042", StageName::Gpu).await);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.requests.len(), 1);
        let (texts, files) = &recorded.requests[0];
        assert!(texts.contains(&("name".to_string(), "truffle-0042".to_string())));
        assert!(texts.contains(&("stage".to_string(), "gpu".to_string())));
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_set_progress_false_on_non_200() {
        let (base, _) = spawn_backend("{}", AxumStatus::CREATED).await;
        assert!(!client(&base).set_progress("truffle-0042", StageName::Led).await);
    }

    #[tokio::test]
    async fn test_upload_sends_existing_files_only() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("burn_test.txt");
        std::fs::write(&log, "burn output").unwrap();
        let missing_csv = dir.path().join("burn_test.csv");

        let (base, recorded) = spawn_backend("{}", AxumStatus::OK).await;
        let files = vec![
            ("gpuTestFile".to_string(), log),
            ("gpuTestGraph".to_string(), missing_csv),
        ];
        assert!(
            client(&base)
                .upload_artifacts("truffle-0001", StageName::Gpu, &files)
                .await
        );

        let recorded = recorded.lock().unwrap();
        let (_, sent) = &recorded.requests[0];
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "gpuTestFile");
        assert_eq!(sent[0].1, b"burn output");
    }

    #[tokio::test]
    async fn test_upload_with_no_files_on_disk_sends_nothing() {
        let dir = tempdir().unwrap();
        let (base, recorded) = spawn_backend("{}", AxumStatus::OK).await;
        let files = vec![("ledTestFile".to_string(), dir.path().join("absent.txt"))];
        assert!(
            !client(&base)
                .upload_artifacts("truffle-0001", StageName::Led, &files)
                .await
        );
        assert!(recorded.lock().unwrap().requests.is_empty());
    }

    #[tokio::test]
    async fn test_upload_artifact_single_file() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("led_test.txt");
        std::fs::write(&log, "leds ok").unwrap();
        let (base, recorded) = spawn_backend("{}", AxumStatus::OK).await;

        client(&base)
            .upload_artifact("truffle-0001", "ledTestFile", &log, Some(StageName::Led))
            .await
            .unwrap();
        assert_eq!(recorded.lock().unwrap().requests.len(), 1);

        let missing = client(&base)
            .upload_artifact("truffle-0001", "ledTestFile", &dir.path().join("x"), None)
            .await;
        assert!(matches!(missing, Err(BackendError::Artifact { .. })));
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("nvme_test.txt");
        std::fs::write(&log, "nvme").unwrap();
        let base = closed_port_url().await;
        let files = vec![("nvmeTestFile".to_string(), log)];
        assert!(
            !client(&base)
                .upload_artifacts("truffle-0001", StageName::Nvme, &files)
                .await
        );
    }
}
