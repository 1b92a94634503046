//! Concurrent fan-out for the final stage.
//!
//! Every member runs as its own tokio task, launched with a fixed stagger.
//! Members never share files and do not cancel one another; results flow
//! back over an mpsc channel and land in a per-name map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::executor::{ExecutionResult, StageExecutor};
use crate::stage::StageRunSpec;

/// Aggregated outcome of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct ParallelSummary {
    /// Pass/fail per member name.
    pub results: BTreeMap<String, bool>,
    /// Full results in completion order.
    pub details: Vec<ExecutionResult>,
}

impl ParallelSummary {
    pub fn add_result(&mut self, result: ExecutionResult) {
        let entry = self
            .results
            .entry(result.stage_name.clone())
            .or_insert(true);
        *entry = *entry && result.succeeded;
        self.details.push(result);
    }

    /// Logical AND of every member; vacuously true for no members.
    pub fn success(&self) -> bool {
        self.results.values().all(|ok| *ok)
    }

    pub fn failed_tasks(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn was_cancelled(&self) -> bool {
        self.details.iter().any(|r| r.cancelled)
    }
}

/// Runs a set of stage members concurrently.
#[derive(Debug, Clone)]
pub struct ParallelCoordinator {
    stagger: Duration,
}

impl Default for ParallelCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ParallelCoordinator {
    pub fn new(stagger: Duration) -> Self {
        Self { stagger }
    }

    /// Launch every spec, wait for all of them and fold the results.
    ///
    /// `on_finished` is called as each member completes. Members not yet
    /// launched when `cancel` fires are recorded as failed.
    pub async fn run_many(
        &self,
        specs: &[StageRunSpec],
        executor: Arc<dyn StageExecutor>,
        cancel: &CancellationToken,
        mut on_finished: impl FnMut(&ExecutionResult),
    ) -> ParallelSummary {
        let mut summary = ParallelSummary::default();
        if specs.is_empty() {
            return summary;
        }

        let (result_tx, mut result_rx) = mpsc::channel::<ExecutionResult>(specs.len());
        let mut handles = Vec::with_capacity(specs.len());

        for (i, spec) in specs.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.stagger) => {}
                }
            }

            info!(task = %spec.name, target = %spec.target, "Launching concurrent task");
            let result_tx = result_tx.clone();
            let executor = executor.clone();
            let spec = spec.clone();
            let cancel = cancel.clone();
            let name = spec.name.clone();

            let handle = tokio::spawn(async move {
                let result = executor.execute(&spec, &cancel).await;
                result_tx.send(result).await.ok();
            });
            handles.push((name, handle));
        }
        drop(result_tx);

        while let Some(result) = result_rx.recv().await {
            on_finished(&result);
            summary.add_result(result);
        }

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "Concurrent task panicked");
                summary.results.insert(name, false);
            }
        }

        for spec in specs {
            if !summary.results.contains_key(&spec.name) {
                warn!(task = %spec.name, "Concurrent task was never launched");
                summary.results.insert(spec.name.clone(), false);
            }
        }

        summary
    }
}
