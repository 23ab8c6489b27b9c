//! MEGate selection: decides which scored combinations are close enough to their
//! e-model's exemplar to be accepted.
//!
//! Each gating e-model is processed independently:
//!
//! 1. find its repaired exemplar row (unless `skip_repaired_exemplar`);
//! 2. optionally check that the unrepaired exemplar reproduced the optimization scores;
//! 3. gate every candidate feature against `max(T, T * exemplar)` (or `T` alone);
//! 4. optionally keep only the best percentile of passing candidates.
//!
//! The table is only read; accepted combinations form a new, smaller table, and
//! every gated candidate keeps its per-feature verdicts in [`Selection::evaluations`].

pub mod names;
pub mod output;
pub mod thresholds;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::combo::{CombinationRow, ScoreMap, Uid};
use crate::config::MegateConfig;
use crate::pattern::{AnyOf, PatternCache, PatternError, PatternList};

pub use names::{make_names_compliant, neuron_compliant, NameChange};
pub use output::{write_selection, OutputFiles, EVALUATION_FILENAME};
pub use thresholds::{FeatureThresholds, ThresholdRuleSpec, ThresholdRules};

pub const THRESHOLD_CURRENT: &str = "threshold_current";
pub const HOLDING_CURRENT: &str = "holding_current";

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("select_perc_best must be in (0, 100], got {0}")]
    InvalidPercentile(f64),
    #[error("e-model {emodel} has {count} repaired exemplar rows, expected one")]
    AmbiguousExemplar { emodel: String, count: usize },
    #[error("e-model {emodel}: scores of unrepaired exemplar (uid {uid}) differ from optimization scores: {detail}")]
    OptScoreMismatch {
        emodel: String,
        uid: Uid,
        detail: String,
    },
    #[error("no threshold rule covers feature {feature} of e-model {emodel} ({fullmtype}, {etype})")]
    NoThreshold {
        emodel: String,
        fullmtype: String,
        etype: String,
        feature: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// One accepted combination. Field order is the column order of the full output table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedCombo {
    #[serde(skip)]
    pub uid: Uid,
    pub morph_name: String,
    pub layer: String,
    pub fullmtype: String,
    pub etype: String,
    pub emodel: String,
    pub combo_name: String,
    pub threshold_current: Option<f64>,
    pub holding_current: Option<f64>,
}

/// Verdict on one feature of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureCheck {
    /// `None` when the candidate has no value for the feature.
    pub value: Option<f64>,
    pub limit: f64,
    pub passed: bool,
}

/// Every gated candidate, passing or not.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEvaluation {
    pub uid: Uid,
    pub emodel: String,
    pub morph_name: String,
    pub scored: bool,
    pub features: BTreeMap<String, FeatureCheck>,
    /// Scored and every feature within its limit.
    pub passed_all: bool,
    /// Survived the best-percentile cut as well.
    pub selected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EModelStatus {
    Selected,
    NoExemplar,
    ExemplarNotScored,
    NoCandidates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EModelOutcome {
    pub emodel: String,
    pub status: EModelStatus,
    pub candidates: usize,
    pub passed: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionSummary {
    pub emodels: Vec<EModelOutcome>,
}

impl SelectionSummary {
    pub fn selected(&self) -> usize {
        self.emodels.iter().map(|e| e.selected).sum()
    }

    pub fn skipped(&self) -> usize {
        self.emodels
            .iter()
            .filter(|e| e.status != EModelStatus::Selected)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Accepted combinations in uid order.
    pub accepted: Vec<AcceptedCombo>,
    /// Gated candidates in uid order.
    pub evaluations: Vec<CandidateEvaluation>,
    pub summary: SelectionSummary,
}

pub struct Megate {
    skip_features: AnyOf,
    rules: ThresholdRules,
    select_perc_best: Option<f64>,
    skip_repaired_exemplar: bool,
    check_opt_scores: bool,
}

impl Megate {
    pub fn new(config: &MegateConfig) -> Result<Self, SelectError> {
        if let Some(perc) = config.select_perc_best {
            if !(perc > 0.0 && perc <= 100.0) {
                return Err(SelectError::InvalidPercentile(perc));
            }
        }
        let mut cache = PatternCache::new();
        let skip_features =
            PatternList::Many(config.to_skip_features.clone()).compile(&mut cache)?;
        let rules = ThresholdRules::compile(&config.megate_thresholds, &mut cache)?;
        Ok(Self {
            skip_features,
            rules,
            select_perc_best: config.select_perc_best,
            skip_repaired_exemplar: config.skip_repaired_exemplar,
            check_opt_scores: config.check_opt_scores,
        })
    }

    pub fn select(&self, rows: &[CombinationRow]) -> Result<Selection, SelectError> {
        let emodels: BTreeSet<&str> = rows
            .iter()
            .filter(|r| !r.is_original)
            .map(|r| r.emodel.as_str())
            .collect();

        let mut selection = Selection::default();
        for emodel in emodels {
            let outcome = self.select_emodel(rows, emodel, &mut selection)?;
            debug!(emodel, status = ?outcome.status, passed = outcome.passed, "e-model gated");
            selection.summary.emodels.push(outcome);
        }
        selection.accepted.sort_by_key(|c| c.uid);
        selection.evaluations.sort_by_key(|e| e.uid);

        info!(
            emodels = selection.summary.emodels.len(),
            skipped = selection.summary.skipped(),
            selected = selection.accepted.len(),
            "selection finished"
        );
        Ok(selection)
    }

    fn select_emodel(
        &self,
        rows: &[CombinationRow],
        emodel: &str,
        selection: &mut Selection,
    ) -> Result<EModelOutcome, SelectError> {
        let mut outcome = EModelOutcome {
            emodel: emodel.to_string(),
            status: EModelStatus::Selected,
            candidates: 0,
            passed: 0,
            selected: 0,
        };

        let exemplar_scores = if self.skip_repaired_exemplar {
            None
        } else {
            let exemplars: Vec<&CombinationRow> = rows
                .iter()
                .filter(|r| r.emodel == emodel && r.is_exemplar && r.is_repaired && !r.is_original)
                .collect();
            match exemplars.as_slice() {
                [] => {
                    warn!(emodel, "no repaired exemplar row, skipping e-model");
                    outcome.status = EModelStatus::NoExemplar;
                    return Ok(outcome);
                }
                [exemplar] => match &exemplar.scores {
                    Some(scores) => Some(scores),
                    None => {
                        warn!(
                            emodel,
                            uid = exemplar.uid,
                            "repaired exemplar was never scored, skipping e-model"
                        );
                        outcome.status = EModelStatus::ExemplarNotScored;
                        return Ok(outcome);
                    }
                },
                many => {
                    return Err(SelectError::AmbiguousExemplar {
                        emodel: emodel.to_string(),
                        count: many.len(),
                    })
                }
            }
        };

        if self.check_opt_scores {
            self.check_opt_score_parity(rows, emodel)?;
        }

        let candidates: Vec<&CombinationRow> = rows
            .iter()
            .filter(|r| r.emodel == emodel && !r.is_exemplar)
            .collect();
        outcome.candidates = candidates.len();
        if candidates.is_empty() {
            warn!(emodel, "no candidate combinations, skipping e-model");
            outcome.status = EModelStatus::NoCandidates;
            return Ok(outcome);
        }

        let features = self.feature_universe(exemplar_scores, &candidates);

        let mut passed = Vec::new();
        let mut evaluations = Vec::with_capacity(candidates.len());
        for row in candidates {
            let fullmtype = row.fullmtype.as_deref().unwrap_or_default();
            let etype = row.etype.as_deref().unwrap_or_default();
            let thresholds = self.rules.for_combination(emodel, fullmtype, etype);

            let mut checks = BTreeMap::new();
            for feature in &features {
                let threshold =
                    thresholds
                        .threshold_for(feature)
                        .ok_or_else(|| SelectError::NoThreshold {
                            emodel: emodel.to_string(),
                            fullmtype: fullmtype.to_string(),
                            etype: etype.to_string(),
                            feature: feature.to_string(),
                        })?;
                let exemplar_value = exemplar_scores.and_then(|s| present(s, feature));
                let value = row.scores.as_ref().and_then(|s| present(s, feature));
                let check = FeatureCheck {
                    value,
                    limit: feature_limit(threshold, exemplar_value),
                    passed: feature_passes(value, threshold, exemplar_value),
                };
                checks.insert(feature.to_string(), check);
            }
            let passed_all = row.scores.is_some() && checks.values().all(|c| c.passed);
            if passed_all {
                passed.push(row);
            }
            evaluations.push(CandidateEvaluation {
                uid: row.uid,
                emodel: emodel.to_string(),
                morph_name: row.morph_name.clone(),
                scored: row.scores.is_some(),
                features: checks,
                passed_all,
                selected: false,
            });
        }
        outcome.passed = passed.len();

        let kept = match self.select_perc_best {
            Some(perc) => self.best_percentile(passed, perc),
            None => passed,
        };
        outcome.selected = kept.len();
        let kept_uids: BTreeSet<Uid> = kept.iter().map(|r| r.uid).collect();
        for evaluation in &mut evaluations {
            evaluation.selected = kept_uids.contains(&evaluation.uid);
        }
        selection.evaluations.extend(evaluations);
        selection.accepted.extend(kept.into_iter().map(accept));
        Ok(outcome)
    }

    /// Non-skipped features to gate on: those holding a value on the exemplar, or,
    /// without an exemplar, on any candidate.
    fn feature_universe<'a>(
        &self,
        exemplar: Option<&'a ScoreMap>,
        candidates: &[&'a CombinationRow],
    ) -> BTreeSet<&'a str> {
        let sources: Vec<&'a ScoreMap> = match exemplar {
            Some(scores) => vec![scores],
            None => candidates
                .iter()
                .copied()
                .filter_map(|r| r.scores.as_ref())
                .collect(),
        };
        sources
            .into_iter()
            .flat_map(|scores| scores.iter())
            .filter(|(_, value)| !value.is_nan())
            .map(|(name, _)| name.as_str())
            .filter(|name| !self.skip_features.matches(name))
            .collect()
    }

    /// The original-id unrepaired exemplar must reproduce the optimization scores
    /// exactly, feature set and bit pattern alike.
    fn check_opt_score_parity(&self, rows: &[CombinationRow], emodel: &str) -> Result<(), SelectError> {
        let originals: BTreeSet<&str> = rows
            .iter()
            .filter(|r| r.emodel == emodel)
            .map(|r| r.original_emodel.as_str())
            .collect();
        let checked = rows.iter().filter(|r| {
            r.is_exemplar && !r.is_repaired && r.is_original && originals.contains(r.original_emodel.as_str())
        });
        for row in checked {
            let mismatch = |detail: String| SelectError::OptScoreMismatch {
                emodel: emodel.to_string(),
                uid: row.uid,
                detail,
            };
            let scores = row.scores.as_ref().ok_or_else(|| {
                mismatch(match &row.exception {
                    Some(exception) => format!("exemplar failed to score: {exception}"),
                    None => "exemplar was never scored".to_string(),
                })
            })?;
            let opt_scores = row
                .opt_scores
                .as_ref()
                .ok_or_else(|| mismatch("no optimization scores recorded".to_string()))?;
            if let Some(detail) = compare_scores(scores, opt_scores) {
                return Err(mismatch(detail));
            }
        }
        Ok(())
    }

    fn best_percentile<'a>(&self, passed: Vec<&'a CombinationRow>, perc: f64) -> Vec<&'a CombinationRow> {
        let aggregates: Vec<Option<f64>> = passed
            .iter()
            .map(|row| {
                row.scores.as_ref().and_then(|scores| {
                    median(
                        scores
                            .iter()
                            .filter(|(name, v)| !v.is_nan() && !self.skip_features.matches(name))
                            .map(|(_, v)| *v)
                            .collect(),
                    )
                })
            })
            .collect();
        let Some(cutoff) = percentile(aggregates.iter().flatten().copied().collect(), perc) else {
            return passed;
        };
        passed
            .into_iter()
            .zip(aggregates)
            .filter(|(_, aggregate)| aggregate.map_or(true, |a| a <= cutoff))
            .map(|(row, _)| row)
            .collect()
    }
}

/// Feature value unless absent or null.
fn present(scores: &ScoreMap, feature: &str) -> Option<f64> {
    scores.get(feature).copied().filter(|v| !v.is_nan())
}

/// `max(T, T * exemplar)`, or `T` without an exemplar value.
pub fn feature_limit(threshold: f64, exemplar: Option<f64>) -> f64 {
    match exemplar {
        Some(e) => threshold.max(threshold * e),
        None => threshold,
    }
}

/// A missing candidate value fails.
pub fn feature_passes(value: Option<f64>, threshold: f64, exemplar: Option<f64>) -> bool {
    let limit = feature_limit(threshold, exemplar);
    value.is_some_and(|v| v <= limit)
}

fn compare_scores(scores: &ScoreMap, opt_scores: &ScoreMap) -> Option<String> {
    let fresh: BTreeSet<&str> = scores.keys().map(String::as_str).collect();
    let recorded: BTreeSet<&str> = opt_scores.keys().map(String::as_str).collect();
    if fresh != recorded {
        let missing: Vec<&str> = recorded.difference(&fresh).copied().collect();
        let extra: Vec<&str> = fresh.difference(&recorded).copied().collect();
        return Some(format!("feature sets differ (missing {missing:?}, extra {extra:?})"));
    }
    let differing: BTreeMap<&str, (f64, f64)> = scores
        .iter()
        .filter_map(|(name, &value)| {
            let opt = opt_scores.get(name).copied().unwrap_or(f64::NAN);
            let same = value.to_bits() == opt.to_bits() || (value.is_nan() && opt.is_nan());
            (!same).then_some((name.as_str(), (value, opt)))
        })
        .collect();
    if differing.is_empty() {
        None
    } else {
        Some(format!("values differ (feature: (score, opt_score)) {differing:?}"))
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Linear-interpolated percentile, `perc` in (0, 100].
fn percentile(mut values: Vec<f64>, perc: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = perc / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(values[lo] + (values[hi] - values[lo]) * (rank - lo as f64))
}

fn accept(row: &CombinationRow) -> AcceptedCombo {
    let layer = row.layer.clone().unwrap_or_default();
    let fullmtype = row.fullmtype.clone().unwrap_or_default();
    AcceptedCombo {
        uid: row.uid,
        combo_name: format!("{}_{}_{}_{}", row.emodel, fullmtype, layer, row.morph_name),
        morph_name: row.morph_name.clone(),
        layer,
        fullmtype,
        etype: row.etype.clone().unwrap_or_default(),
        emodel: row.emodel.clone(),
        threshold_current: row.extra_value(THRESHOLD_CURRENT),
        holding_current: row.extra_value(HOLDING_CURRENT),
    }
}
