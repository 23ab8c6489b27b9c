//! E-model inputs: the e-model/e-type map and the optimized e-model definitions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::loose;
use crate::pattern::{PatternCache, PatternError, MATCH_ALL};

#[derive(Debug, thiserror::Error)]
pub enum EModelError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("e-model {0} lists no layers")]
    NoLayers(String),
    #[error("no definition for e-model {0}")]
    MissingDefinition(String),
    #[error("morph_path for e-model {0} not found")]
    MissingMorphPath(String),
    #[error("no directory for e-model {0}: set emodel_dir or emodels_dir")]
    MissingDirectory(String),
}

fn match_all() -> String {
    MATCH_ALL.to_string()
}

/// One entry of the e-model/e-type map, keyed by the original e-model id.
#[derive(Debug, Clone, Deserialize)]
pub struct EModelEtypeEntry {
    /// Identifier used by the recipe and the MEGate thresholds.
    #[serde(alias = "mm_recipe_id")]
    pub mm_recipe: String,
    #[serde(default = "match_all", alias = "etype_regex")]
    pub etype: String,
    #[serde(default = "match_all", alias = "mtype_regex")]
    pub mtype: String,
    #[serde(default = "match_all", alias = "morph_name_regex")]
    pub morph_name: String,
    #[serde(deserialize_with = "loose::strings")]
    pub layer: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EModelEtypeMap {
    entries: BTreeMap<String, EModelEtypeEntry>,
}

/// One `(layer, fullmtype, etype)` combination an e-model may be paired with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEModel {
    pub emodel: String,
    pub layer: String,
    pub fullmtype: String,
    pub etype: String,
    pub morph_name_regex: String,
    pub original_emodel: String,
}

impl EModelEtypeMap {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EModelError> {
        let path = path.as_ref();
        let text = read(path)?;
        let entries = serde_json::from_str(&text).map_err(|source| EModelError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(entries)
    }

    pub fn new(entries: BTreeMap<String, EModelEtypeEntry>) -> Result<Self, EModelError> {
        if let Some((name, _)) = entries.iter().find(|(_, e)| e.layer.is_empty()) {
            return Err(EModelError::NoLayers(name.clone()));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &EModelEtypeEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, original_emodel: &str) -> Option<&EModelEtypeEntry> {
        self.entries.get(original_emodel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expands every entry over the known full m-types and e-types.
    ///
    /// Yields one record per `(layer, fullmtype, etype)` where `fullmtype` matches the
    /// entry's m-type pattern and `etype` its e-type pattern, in
    /// entry / layer / fullmtype / etype order.
    pub fn resolve<'a>(
        &self,
        fullmtypes: impl IntoIterator<Item = &'a str> + Clone,
        etypes: impl IntoIterator<Item = &'a str> + Clone,
        cache: &mut PatternCache,
    ) -> Result<Vec<ResolvedEModel>, EModelError> {
        let mut resolved = Vec::new();
        for (original_emodel, entry) in &self.entries {
            let mtype_pattern = cache.get(&entry.mtype)?;
            let etype_pattern = cache.get(&entry.etype)?;
            // Validate early so a bad morphology pattern fails before the join.
            cache.get(&entry.morph_name)?;

            for layer in &entry.layer {
                for fullmtype in fullmtypes.clone() {
                    if !mtype_pattern.matches(fullmtype) {
                        continue;
                    }
                    for etype in etypes.clone() {
                        if !etype_pattern.matches(etype) {
                            continue;
                        }
                        resolved.push(ResolvedEModel {
                            emodel: entry.mm_recipe.clone(),
                            layer: layer.clone(),
                            fullmtype: fullmtype.to_string(),
                            etype: etype.to_string(),
                            morph_name_regex: entry.morph_name.clone(),
                            original_emodel: original_emodel.clone(),
                        });
                    }
                }
            }
        }
        Ok(resolved)
    }
}

/// Optimized parameters and bookkeeping for one original e-model.
#[derive(Debug, Clone, Deserialize)]
pub struct EModelDefinition {
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    /// Scores recorded by the optimization run.
    #[serde(default)]
    pub fitness: BTreeMap<String, f64>,
    #[serde(default)]
    pub morph_path: Option<String>,
    #[serde(default)]
    pub etype: Option<String>,
    #[serde(default)]
    pub emodel_dir: Option<PathBuf>,
}

impl EModelDefinition {
    /// Exemplar morphology as `(name, extension)`, taken from `morph_path`.
    pub fn exemplar_morphology(&self, original_emodel: &str) -> Result<(String, String), EModelError> {
        let morph_path = self
            .morph_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EModelError::MissingMorphPath(original_emodel.to_string()))?;
        let path = Path::new(morph_path);
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| EModelError::MissingMorphPath(original_emodel.to_string()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        Ok((name.to_string(), ext))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EModelDefinitions {
    definitions: BTreeMap<String, EModelDefinition>,
}

impl EModelDefinitions {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EModelError> {
        let path = path.as_ref();
        let text = read(path)?;
        let definitions = serde_json::from_str(&text).map_err(|source| EModelError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { definitions })
    }

    pub fn new(definitions: BTreeMap<String, EModelDefinition>) -> Self {
        Self { definitions }
    }

    pub fn get(&self, original_emodel: &str) -> Result<&EModelDefinition, EModelError> {
        self.definitions
            .get(original_emodel)
            .ok_or_else(|| EModelError::MissingDefinition(original_emodel.to_string()))
    }

    /// Directory holding the e-model code: the definition's own `emodel_dir`, or
    /// `<emodels_dir>/<original_emodel>`.
    pub fn emodel_dir(
        &self,
        original_emodel: &str,
        emodels_dir: Option<&Path>,
    ) -> Result<PathBuf, EModelError> {
        let definition = self.get(original_emodel)?;
        match (&definition.emodel_dir, emodels_dir) {
            (Some(dir), Some(base)) if dir.is_relative() => Ok(base.join(dir)),
            (Some(dir), _) => Ok(dir.clone()),
            (None, Some(base)) => Ok(base.join(original_emodel)),
            (None, None) => Err(EModelError::MissingDirectory(original_emodel.to_string())),
        }
    }
}

fn read(path: &Path) -> Result<String, EModelError> {
    std::fs::read_to_string(path).map_err(|source| EModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}
