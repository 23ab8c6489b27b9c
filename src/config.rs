//! Configuration files for the prepare/run phases and for MEGate selection.
//!
//! Both are JSON (`.json`) or YAML (anything else). Relative paths are resolved
//! against the directory holding the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::megate::ThresholdRuleSpec;
use crate::store::{ComboStore, FloatFormat};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Reads a JSON or YAML document, chosen by extension.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn base_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

// =============================================================================
// Prepare / run
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub recipe_path: PathBuf,
    /// Morphology database (neurondb `.dat`, JSON or YAML).
    pub morph_path: PathBuf,
    pub rep_morph_path: PathBuf,
    pub unrep_morph_path: PathBuf,
    pub emodel_etype_map_path: PathBuf,
    /// E-model definitions: parameters, optimization fitness, exemplar morphology.
    pub final_json_path: PathBuf,
    /// Base directory for e-model code; `<emodels_dir>/<original_emodel>` by default.
    #[serde(default)]
    pub emodels_dir: Option<PathBuf>,
    #[serde(default)]
    pub scores_db: Option<PathBuf>,
    #[serde(default)]
    pub skip_repaired_exemplar: bool,
    #[serde(default)]
    pub float_format: FloatFormat,
    #[serde(default)]
    pub scorer: Option<ScorerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Program run once per combination. Bare names are looked up on `PATH`.
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub parallel: Option<usize>,
}

impl ScorerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}

impl ProjectConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Self = load_document(path)?;
        config.validate()?;
        config.resolve_paths(&base_dir(path));
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(scorer) = &self.scorer {
            if scorer.program.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("scorer.program is empty".to_string()));
            }
            if matches!(scorer.parallel, Some(0)) {
                return Err(ConfigError::Invalid("scorer.parallel must be >= 1".to_string()));
            }
            if let Some(secs) = scorer.timeout_secs {
                if !(secs.is_finite() && secs > 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "scorer.timeout_secs must be positive, got {secs}"
                    )));
                }
            }
        }
        if let FloatFormat::Significant(0) = self.float_format {
            return Err(ConfigError::Invalid(
                "float_format.significant must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.recipe_path,
            &mut self.morph_path,
            &mut self.rep_morph_path,
            &mut self.unrep_morph_path,
            &mut self.emodel_etype_map_path,
            &mut self.final_json_path,
        ] {
            resolve(base, path);
        }
        for path in [&mut self.emodels_dir, &mut self.scores_db].into_iter().flatten() {
            resolve(base, path);
        }
        if let Some(scorer) = &mut self.scorer {
            if scorer.program.components().count() > 1 {
                resolve(base, &mut scorer.program);
            }
        }
    }

    /// Configured database, else `MECOMBO_SCORES_DB`, else `scores.sqlite`.
    pub fn scores_db(&self) -> PathBuf {
        self.scores_db
            .clone()
            .unwrap_or_else(ComboStore::default_path)
    }
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MegateConfig {
    #[serde(default)]
    pub scores_db: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Features matching any of these patterns always pass.
    #[serde(default)]
    pub to_skip_features: Vec<String>,
    /// Evaluated in order; later matches override earlier ones per feature.
    #[serde(default)]
    pub megate_thresholds: Vec<ThresholdRuleSpec>,
    #[serde(default)]
    pub select_perc_best: Option<f64>,
    #[serde(default)]
    pub skip_repaired_exemplar: bool,
    #[serde(default = "default_true")]
    pub check_opt_scores: bool,
    #[serde(default)]
    pub make_names_neuron_compliant: bool,
    #[serde(default = "default_extneurondb_filename")]
    pub extneurondb_filename: String,
    #[serde(default = "default_mecombo_emodel_filename")]
    pub mecombo_emodel_filename: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output_megate")
}

fn default_true() -> bool {
    true
}

fn default_extneurondb_filename() -> String {
    "extneurondb.dat".to_string()
}

fn default_mecombo_emodel_filename() -> String {
    "mecombo_emodel.csv".to_string()
}

impl Default for MegateConfig {
    fn default() -> Self {
        Self {
            scores_db: None,
            output_dir: default_output_dir(),
            to_skip_features: Vec::new(),
            megate_thresholds: Vec::new(),
            select_perc_best: None,
            skip_repaired_exemplar: false,
            check_opt_scores: true,
            make_names_neuron_compliant: false,
            extneurondb_filename: default_extneurondb_filename(),
            mecombo_emodel_filename: default_mecombo_emodel_filename(),
        }
    }
}

impl MegateConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Self = load_document(path)?;
        if config.megate_thresholds.is_empty() {
            return Err(ConfigError::Invalid(
                "megate_thresholds must contain at least one rule".to_string(),
            ));
        }
        let base = base_dir(path);
        resolve(&base, &mut config.output_dir);
        if let Some(db) = &mut config.scores_db {
            resolve(&base, db);
        }
        Ok(config)
    }

    pub fn scores_db(&self) -> PathBuf {
        self.scores_db
            .clone()
            .unwrap_or_else(ComboStore::default_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternList;

    #[test]
    fn project_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepare.yaml");
        std::fs::write(
            &path,
            "recipe_path: recipe.yaml\n\
             morph_path: morphs/neuronDB.dat\n\
             rep_morph_path: /data/repaired\n\
             unrep_morph_path: unrepaired\n\
             emodel_etype_map_path: emodel_etype_map.json\n\
             final_json_path: final.json\n\
             emodels_dir: emodels\n\
             float_format: shortest\n\
             scorer:\n  program: python3\n  args: [score.py]\n  timeout_secs: 600\n",
        )
        .unwrap();
        let config = ProjectConfig::from_path(&path).unwrap();
        assert_eq!(config.recipe_path, dir.path().join("recipe.yaml"));
        assert_eq!(config.rep_morph_path, PathBuf::from("/data/repaired"));
        assert_eq!(config.emodels_dir, Some(dir.path().join("emodels")));
        assert_eq!(config.float_format, FloatFormat::Shortest);
        let scorer = config.scorer.unwrap();
        assert_eq!(scorer.program, PathBuf::from("python3"));
        assert_eq!(scorer.timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn megate_config_defaults_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("megate.json");
        std::fs::write(
            &path,
            r#"{
                "to_skip_features": ["Step3\\..*"],
                "megate_thresholds": [
                    {"megate_threshold": 5},
                    {"emodel": ["emodel1", "emodel2"], "features": "Step1", "megate_threshold": 3}
                ]
            }"#,
        )
        .unwrap();
        let config = MegateConfig::from_path(&path).unwrap();
        assert_eq!(config.output_dir, dir.path().join("output_megate"));
        assert!(config.check_opt_scores);
        assert_eq!(config.extneurondb_filename, "extneurondb.dat");
        assert_eq!(config.megate_thresholds[0].emodel, PatternList::default());
        assert_eq!(config.megate_thresholds[1].megate_threshold, 3.0);
    }

    #[test]
    fn empty_rule_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("megate.yaml");
        std::fs::write(&path, "megate_thresholds: []\n").unwrap();
        assert!(matches!(
            MegateConfig::from_path(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
