mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use common::Fixture;
use mecombo::execute::{build_tasks, run_combos, RunOptions, ScoreOutcome, ScoreTask, Scorer};
use mecombo::store::{ComboStore, FloatFormat, PersistedEModel};

/// Scores every task with its uid; fails the listed uids.
struct MockScorer {
    fail: Vec<i64>,
    seen: Mutex<Vec<ScoreTask>>,
}

#[async_trait::async_trait]
impl Scorer for MockScorer {
    async fn score(&self, task: &ScoreTask) -> Result<ScoreOutcome, String> {
        self.seen.lock().unwrap().push(task.clone());
        tokio::task::yield_now().await;
        if self.fail.contains(&task.uid) {
            return Err(format!("simulation crashed for uid {}", task.uid));
        }
        Ok(ScoreOutcome {
            scores: BTreeMap::from([("Step1.SpikeCount".to_string(), task.uid as f64)]),
            extra_values: BTreeMap::from([("holding_current".to_string(), Some(-0.05))]),
        })
    }
}

async fn prepared_store(fixture: &Fixture) -> ComboStore {
    let table = fixture.build(false).unwrap();
    let store = ComboStore::open(fixture.path("scores.sqlite"), FloatFormat::default()).unwrap();
    store.write_table(&table, false).await.unwrap();
    // opt_emodel2 is deliberately left without a stored definition
    store
        .write_emodels(vec![PersistedEModel {
            original_emodel: "opt_emodel1".to_string(),
            emodel_dir: fixture.path("emodels/opt_emodel1"),
            params: BTreeMap::from([("gnabar_hh".to_string(), 0.12)]),
        }])
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn every_pending_row_is_scored_or_failed_once() {
    let fixture = Fixture::new();
    let store = prepared_store(&fixture).await;
    let scorer = Arc::new(MockScorer {
        fail: vec![10],
        seen: Mutex::new(Vec::new()),
    });

    let summary = run_combos(&store, scorer.clone(), &RunOptions { parallel: 3 })
        .await
        .unwrap();
    assert_eq!(summary.pending, 12);
    // 6 rows of opt_emodel2 have no definition, uid 10 crashes
    assert_eq!(summary.scored, 5);
    assert_eq!(summary.failed, 7);

    let seen = scorer.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 6);
    let task = seen.iter().find(|t| t.uid == 8).unwrap();
    assert_eq!(task.emodel, "emodel1");
    assert_eq!(task.emodel_dir, fixture.path("emodels/opt_emodel1"));
    assert_eq!(task.params["gnabar_hh"], 0.12);
    assert_eq!(task.morph_path, fixture.path("repaired/morph1.asc"));

    let rows = store.read_table().await.unwrap();
    for row in &rows {
        assert!(!row.to_run);
        assert!(row.scores.is_some() != row.exception.is_some(), "uid {}", row.uid);
    }
    assert!(rows[10].exception.as_deref().unwrap().contains("crashed"));
    assert!(rows[4].exception.as_deref().unwrap().contains("opt_emodel2"));
    assert_eq!(rows[8].scores.as_ref().unwrap()["Step1.SpikeCount"], 8.0);
    assert_eq!(rows[8].extra_value("holding_current"), Some(-0.05));

    // nothing left to do on a second pass
    let again = run_combos(&store, scorer.clone(), &RunOptions::default())
        .await
        .unwrap();
    assert_eq!((again.pending, again.scored, again.failed), (0, 0, 0));
    assert_eq!(scorer.seen.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn tasks_carry_the_scoring_identifier() {
    let fixture = Fixture::new();
    let store = prepared_store(&fixture).await;
    let rows = store.pending().await.unwrap();
    let emodels = store.read_emodels().await.unwrap();

    let (tasks, unrunnable) = build_tasks(&rows, &emodels);
    let ids: Vec<(i64, &str)> = tasks.iter().map(|t| (t.uid, t.emodel.as_str())).collect();
    assert_eq!(
        ids,
        vec![
            (0, "opt_emodel1"),
            (1, "emodel1"),
            (2, "opt_emodel1"),
            (3, "emodel1"),
            (8, "emodel1"),
            (10, "emodel1"),
        ]
    );
    assert_eq!(
        unrunnable.iter().map(|(uid, _)| *uid).collect::<Vec<_>>(),
        vec![4, 5, 6, 7, 9, 11]
    );
    assert_eq!(tasks[0].morph_path, fixture.path("unrepaired/morph1.asc"));
}
