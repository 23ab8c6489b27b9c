//! Score executor: runs every pending combination through a [`Scorer`] and writes
//! the outcome back to the store as results arrive.

pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::combo::{CombinationRow, ExtraValues, ScoreMap, Uid};
use crate::store::{ComboStore, PersistedEModel, ScoreRecord, StoreError};

pub use process::ProcessScorer;

/// Everything a scorer needs for one combination. Self-contained so it can be
/// shipped to a fresh worker process as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTask {
    pub uid: Uid,
    pub emodel: String,
    pub emodel_dir: PathBuf,
    pub params: BTreeMap<String, f64>,
    pub morph_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreOutcome {
    pub scores: ScoreMap,
    pub extra_values: ExtraValues,
}

/// External scoring interface. Failures are reported as the full diagnostic text.
#[async_trait::async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, task: &ScoreTask) -> Result<ScoreOutcome, String>;
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of scorer calls in flight.
    pub parallel: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub pending: usize,
    pub scored: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Splits pending rows into scorer tasks and rows that cannot be scored because
/// their e-model definition was never persisted.
pub fn build_tasks(
    rows: &[CombinationRow],
    emodels: &BTreeMap<String, PersistedEModel>,
) -> (Vec<ScoreTask>, Vec<(Uid, String)>) {
    let mut tasks = Vec::new();
    let mut unrunnable = Vec::new();
    for row in rows.iter().filter(|r| r.to_run) {
        match emodels.get(&row.original_emodel) {
            Some(emodel) => tasks.push(ScoreTask {
                uid: row.uid,
                emodel: row.emodel.clone(),
                emodel_dir: emodel.emodel_dir.clone(),
                params: emodel.params.clone(),
                morph_path: row.morph_path(),
            }),
            None => unrunnable.push((
                row.uid,
                format!("no definition stored for e-model {}", row.original_emodel),
            )),
        }
    }
    (tasks, unrunnable)
}

/// Scores all `to_run` rows. Holds the store's run lock for the whole call.
///
/// A failing combination never aborts the run; only store errors do.
pub async fn run_combos(
    store: &ComboStore,
    scorer: Arc<dyn Scorer>,
    options: &RunOptions,
) -> Result<RunSummary, ExecuteError> {
    let _lock = store.lock_exclusive()?;
    let pending = store.pending().await?;
    let emodels = store.read_emodels().await?;
    let (tasks, unrunnable) = build_tasks(&pending, &emodels);

    let parallel = options.parallel.max(1);
    info!(
        pending = pending.len(),
        tasks = tasks.len(),
        parallel,
        "scoring combinations"
    );

    let mut summary = RunSummary {
        pending: pending.len(),
        ..RunSummary::default()
    };
    for (uid, exception) in unrunnable {
        store
            .save_scores(uid, ScoreRecord::Failed { exception })
            .await?;
        summary.failed += 1;
    }

    let mut results = stream::iter(tasks)
        .map(|task| {
            let scorer = Arc::clone(&scorer);
            async move {
                let uid = task.uid;
                let handle = tokio::spawn(async move { scorer.score(&task).await });
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(format!("scorer task aborted: {e}")),
                };
                (uid, outcome)
            }
        })
        .buffer_unordered(parallel);

    while let Some((uid, outcome)) = results.next().await {
        let record = match outcome {
            Ok(outcome) => {
                summary.scored += 1;
                ScoreRecord::Scored {
                    scores: outcome.scores,
                    extra_values: outcome.extra_values,
                }
            }
            Err(exception) => {
                debug!(uid, %exception, "combination failed");
                summary.failed += 1;
                ScoreRecord::Failed { exception }
            }
        };
        store.save_scores(uid, record).await?;
    }

    info!(
        scored = summary.scored,
        failed = summary.failed,
        "scoring finished"
    );
    Ok(summary)
}
