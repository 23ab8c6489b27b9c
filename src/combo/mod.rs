//! Combination table: one row per candidate (layer, m-type, e-type, morphology, e-model).

pub mod builder;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use builder::{build_combination_table, BuildError, BuildInputs};

/// Stable row identifier, assigned once when the table is built.
pub type Uid = i64;

/// Feature name -> score. Missing or non-finite values read back as NaN.
pub type ScoreMap = BTreeMap<String, f64>;

/// Diagnostic values reported next to the scores (threshold/holding currents).
pub type ExtraValues = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationRow {
    pub uid: Uid,
    pub layer: Option<String>,
    pub fullmtype: Option<String>,
    pub mtype: Option<String>,
    pub msubtype: Option<String>,
    pub etype: Option<String>,
    pub morph_name: String,
    pub morph_ext: String,
    pub morph_dir: PathBuf,
    /// Identifier handed to the scorer.
    pub emodel: String,
    /// E-model id as declared in the e-model/e-type map.
    pub original_emodel: String,
    pub scores: Option<ScoreMap>,
    pub opt_scores: Option<ScoreMap>,
    pub extra_values: Option<ExtraValues>,
    pub exception: Option<String>,
    pub to_run: bool,
    pub is_exemplar: bool,
    pub is_repaired: bool,
    pub is_original: bool,
}

impl CombinationRow {
    pub fn morph_path(&self) -> PathBuf {
        self.morph_dir
            .join(format!("{}{}", self.morph_name, self.morph_ext))
    }

    pub fn extra_value(&self, name: &str) -> Option<f64> {
        self.extra_values
            .as_ref()
            .and_then(|values| values.get(name).copied().flatten())
    }
}

/// Built table with uids fixed in row order.
#[derive(Debug, Clone, Default)]
pub struct CombinationTable {
    rows: Vec<CombinationRow>,
}

impl CombinationTable {
    /// Assigns `uid = position` to every row. The only place uids are created.
    pub(crate) fn from_ordered(mut rows: Vec<CombinationRow>) -> Self {
        for (idx, row) in rows.iter_mut().enumerate() {
            row.uid = idx as Uid;
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[CombinationRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<CombinationRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn exemplar_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_exemplar).count()
    }
}
