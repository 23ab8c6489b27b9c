//! Accepted-table files: the space-separated circuit-building table, the full
//! CSV, the per-feature evaluation log and, when names were rewritten, the
//! rename log. All rows in uid order.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use super::names::make_names_compliant;
use super::{AcceptedCombo, CandidateEvaluation, FeatureCheck, SelectError, Selection};
use crate::combo::Uid;
use crate::config::MegateConfig;

pub const NAME_LOG_FILENAME: &str = "combo_name_log.csv";
pub const EVALUATION_FILENAME: &str = "mecombo_evaluation.csv";

const FULL_COLUMNS: [&str; 8] = [
    "morph_name",
    "layer",
    "fullmtype",
    "etype",
    "emodel",
    "combo_name",
    "threshold_current",
    "holding_current",
];

const EVALUATION_COLUMNS: [&str; 9] = [
    "uid",
    "emodel",
    "morph_name",
    "feature",
    "value",
    "limit",
    "passed",
    "passed_all",
    "selected",
];

/// One line of the evaluation log; a candidate without any gated feature gets a
/// single line with the feature columns empty.
#[derive(Serialize)]
struct EvaluationLine<'a> {
    uid: Uid,
    emodel: &'a str,
    morph_name: &'a str,
    feature: Option<&'a str>,
    value: Option<f64>,
    limit: Option<f64>,
    passed: Option<bool>,
    passed_all: bool,
    selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    pub extneurondb: PathBuf,
    pub mecombo_emodel: PathBuf,
    pub evaluation: PathBuf,
    pub name_log: Option<PathBuf>,
}

/// Writes every output file under `config.output_dir`, renaming combos first if
/// neuron-compliant names were requested.
pub fn write_selection(
    selection: &mut Selection,
    config: &MegateConfig,
) -> Result<OutputFiles, SelectError> {
    std::fs::create_dir_all(&config.output_dir)?;

    let name_log = if config.make_names_neuron_compliant {
        let changes = make_names_compliant(&mut selection.accepted);
        let path = config.output_dir.join(NAME_LOG_FILENAME);
        write_rows(&path, b',', Some(&["old_name", "new_name"]), &changes)?;
        info!(renamed = changes.len(), path = %path.display(), "combo names made compliant");
        Some(path)
    } else {
        None
    };

    let extneurondb = config.output_dir.join(&config.extneurondb_filename);
    write_extneurondb(&extneurondb, &selection.accepted)?;
    let mecombo_emodel = config.output_dir.join(&config.mecombo_emodel_filename);
    write_rows(&mecombo_emodel, b',', Some(&FULL_COLUMNS), &selection.accepted)?;
    let evaluation = config.output_dir.join(EVALUATION_FILENAME);
    write_rows(
        &evaluation,
        b',',
        Some(&EVALUATION_COLUMNS),
        &evaluation_lines(&selection.evaluations),
    )?;

    info!(
        rows = selection.accepted.len(),
        extneurondb = %extneurondb.display(),
        full = %mecombo_emodel.display(),
        "accepted combinations written"
    );
    Ok(OutputFiles {
        extneurondb,
        mecombo_emodel,
        evaluation,
        name_log,
    })
}

fn evaluation_lines(evaluations: &[CandidateEvaluation]) -> Vec<EvaluationLine<'_>> {
    let mut lines = Vec::new();
    for evaluation in evaluations {
        if evaluation.features.is_empty() {
            lines.push(evaluation_line(evaluation, None));
        }
        for (feature, check) in &evaluation.features {
            lines.push(evaluation_line(evaluation, Some((feature.as_str(), check))));
        }
    }
    lines
}

fn evaluation_line<'a>(
    evaluation: &'a CandidateEvaluation,
    check: Option<(&'a str, &FeatureCheck)>,
) -> EvaluationLine<'a> {
    EvaluationLine {
        uid: evaluation.uid,
        emodel: &evaluation.emodel,
        morph_name: &evaluation.morph_name,
        feature: check.map(|(feature, _)| feature),
        value: check.and_then(|(_, c)| c.value),
        limit: check.map(|(_, c)| c.limit),
        passed: check.map(|(_, c)| c.passed),
        passed_all: evaluation.passed_all,
        selected: evaluation.selected,
    }
}

/// `morph_name layer fullmtype etype combo_name`, no header.
pub fn write_extneurondb(path: &Path, combos: &[AcceptedCombo]) -> Result<(), SelectError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path)?;
    for combo in combos {
        writer.write_record([
            &combo.morph_name,
            &combo.layer,
            &combo.fullmtype,
            &combo.etype,
            &combo.combo_name,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Header is written even when there are no rows.
fn write_rows<T: Serialize>(
    path: &Path,
    delimiter: u8,
    header: Option<&[&str]>,
    rows: &[T],
) -> Result<(), SelectError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_path(path)?;
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
