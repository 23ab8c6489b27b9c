//! One OS process per scored combination.
//!
//! The task goes to the child as JSON on stdin; the child prints
//! `{"scores": {...}, "extra_values": {...}}` as its last non-empty stdout line.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ScoreOutcome, ScoreTask, Scorer};
use crate::combo::ExtraValues;

#[derive(Debug, Clone)]
pub struct ProcessScorer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct RawOutcome {
    scores: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    extra_values: ExtraValues,
}

impl ProcessScorer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// A child still running after `timeout` is killed and the task recorded as failed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.program.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| "scorer stdin unavailable".to_string())?;
        let write = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| format!("failed to wait for scorer: {e}"))?;
        // A child that exits without reading its input is judged by its exit status.
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(format!("failed to send task to scorer: {e}"));
            }
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl Scorer for ProcessScorer {
    async fn score(&self, task: &ScoreTask) -> Result<ScoreOutcome, String> {
        let input = serde_json::to_vec(task).map_err(|e| format!("failed to encode task: {e}"))?;
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(input))
                .await
                .map_err(|_| format!("scorer timed out after {:.1}s", limit.as_secs_f64()))??,
            None => self.run(input).await?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(format!(
                "scorer exited with {}\n{}",
                output.status,
                stderr.trim_end()
            ));
        }
        parse_outcome(&output.stdout)
            .map_err(|e| format!("malformed scorer output: {e}\n{}", stderr.trim_end()))
    }
}

/// Parses the last non-empty stdout line; earlier lines are simulator chatter.
pub fn parse_outcome(stdout: &[u8]) -> Result<ScoreOutcome, String> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| "empty output".to_string())?;
    let raw: RawOutcome = serde_json::from_str(line).map_err(|e| e.to_string())?;
    Ok(ScoreOutcome {
        scores: raw
            .scores
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
            .collect(),
        extra_values: raw.extra_values,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn task() -> ScoreTask {
        ScoreTask {
            uid: 7,
            emodel: "emodel1".to_string(),
            emodel_dir: PathBuf::from("/tmp/emodels/emodel1"),
            params: BTreeMap::from([("gbar".to_string(), 0.5)]),
            morph_path: PathBuf::from("/tmp/morphs/morph1.asc"),
        }
    }

    fn sh(script: &str) -> ProcessScorer {
        ProcessScorer::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn parse_takes_last_line_and_maps_null_to_nan() {
        let out = b"loading mechanisms\n{\"scores\": {\"a\": 1.5, \"b\": null}}\n\n";
        let outcome = parse_outcome(out).unwrap();
        assert_eq!(outcome.scores["a"], 1.5);
        assert!(outcome.scores["b"].is_nan());
        assert!(outcome.extra_values.is_empty());
    }

    #[tokio::test]
    async fn child_reads_task_and_reports_scores() {
        let scorer = sh(
            "input=$(cat); case \"$input\" in *morph1.asc*) v=2.0;; *) v=9.0;; esac; \
             echo \"{\\\"scores\\\": {\\\"f\\\": $v}, \\\"extra_values\\\": {\\\"holding_current\\\": null}}\"",
        );
        let outcome = scorer.score(&task()).await.unwrap();
        assert_eq!(outcome.scores["f"], 2.0);
        assert_eq!(outcome.extra_values["holding_current"], None);
    }

    #[tokio::test]
    async fn failing_child_reports_stderr() {
        let scorer = sh("echo 'mechanism not found' >&2; exit 3");
        let err = scorer.score(&task()).await.unwrap_err();
        assert!(err.contains("mechanism not found"), "{err}");
    }

    #[tokio::test]
    async fn hung_child_is_killed_after_timeout() {
        let scorer = sh("sleep 30").with_timeout(Some(Duration::from_millis(200)));
        let err = scorer.score(&task()).await.unwrap_err();
        assert!(err.contains("timed out"), "{err}");
    }
}
