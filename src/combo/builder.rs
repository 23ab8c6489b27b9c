//! Builds the candidate table from the recipe, the morphology release and the
//! e-model/e-type map, then prepends the exemplar rows used as scoring baselines.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{CombinationRow, CombinationTable};
use crate::emodels::{EModelDefinitions, EModelError, EModelEtypeMap, ResolvedEModel};
use crate::morphdb::{MorphRecord, MorphologyMap};
use crate::pattern::{PatternCache, PatternError};
use crate::recipe::Recipe;

/// Extensions tried, in order, when a morphology file has to be located on disk.
pub const MORPHOLOGY_EXTENSIONS: [&str; 3] = [".asc", ".swc", ".h5"];

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("morphologies without a recipe entry (layer, fullmtype, morph_name): {0:?}")]
    UnmatchedMorphologies(Vec<(String, String, String)>),
    #[error("combinations without an e-model (layer, etype, fullmtype): {0:?}")]
    UnmatchedEModels(Vec<(String, String, String)>),
    #[error("morphology {morph_name} for e-model {emodel} not found in morphology release")]
    MissingExemplarMorphology { emodel: String, morph_name: String },
    #[error("morphology file for {morph_name} not found in {}", dir.display())]
    MissingMorphologyFile { morph_name: String, dir: PathBuf },
    #[error(transparent)]
    EModel(#[from] EModelError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

pub struct BuildInputs<'a> {
    pub recipe: &'a Recipe,
    pub morphologies: &'a MorphologyMap,
    pub emodel_map: &'a EModelEtypeMap,
    pub definitions: &'a EModelDefinitions,
    pub rep_morph_dir: &'a Path,
    pub unrep_morph_dir: &'a Path,
    pub skip_repaired_exemplar: bool,
}

/// A morphology row joined with one of its recipe e-types and one e-model.
struct Candidate<'a> {
    morph: &'a MorphRecord,
    etype: &'a str,
    emodel: &'a ResolvedEModel,
}

pub fn build_combination_table(inputs: &BuildInputs<'_>) -> Result<CombinationTable, BuildError> {
    let mut cache = PatternCache::new();

    let joined = join_morphologies_to_recipe(inputs.recipe, inputs.morphologies)?;
    debug!(rows = joined.len(), "joined morphologies to recipe");

    let fullmtypes: Vec<&str> = inputs.recipe.fullmtypes().into_iter().collect();
    let etypes: Vec<&str> = inputs.recipe.etypes().into_iter().collect();
    let resolved = inputs.emodel_map.resolve(
        fullmtypes.iter().copied(),
        etypes.iter().copied(),
        &mut cache,
    )?;
    let candidates = join_emodels(&joined, &resolved)?;
    debug!(rows = candidates.len(), "joined e-models");

    let candidates = remove_morph_regex_failures(candidates, &mut cache)?;

    let mut located: HashMap<&str, String> = HashMap::new();
    let mut rows = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let morph = candidate.morph;
        let morph_ext = match located.get(morph.name.as_str()) {
            Some(ext) => ext.clone(),
            None => {
                let ext = locate_morphology(inputs.rep_morph_dir, &morph.name, morph.ext.as_deref())
                    .ok_or_else(|| BuildError::MissingMorphologyFile {
                        morph_name: morph.name.clone(),
                        dir: inputs.rep_morph_dir.to_path_buf(),
                    })?;
                located.insert(morph.name.as_str(), ext.clone());
                ext
            }
        };
        rows.push(CombinationRow {
            uid: 0,
            layer: Some(morph.layer.clone()),
            fullmtype: Some(morph.fullmtype.clone()),
            mtype: Some(morph.mtype.clone()),
            msubtype: Some(morph.msubtype.clone()),
            etype: Some(candidate.etype.to_string()),
            morph_name: morph.name.clone(),
            morph_ext,
            morph_dir: inputs.rep_morph_dir.to_path_buf(),
            emodel: candidate.emodel.emodel.clone(),
            original_emodel: candidate.emodel.original_emodel.clone(),
            scores: None,
            opt_scores: None,
            extra_values: None,
            exception: None,
            to_run: true,
            is_exemplar: false,
            is_repaired: true,
            is_original: false,
        });
    }

    let mut table = create_exemplar_rows(inputs)?;
    let exemplars = table.len();
    table.extend(rows);
    let table = CombinationTable::from_ordered(table);
    info!(
        rows = table.len(),
        exemplars,
        emodels = inputs.emodel_map.len(),
        "combination table built"
    );
    Ok(table)
}

/// Pairs each morphology with every recipe e-type of its `(fullmtype, layer)`.
/// A morphology without a recipe entry is a data inconsistency, not a skip.
fn join_morphologies_to_recipe<'a>(
    recipe: &'a Recipe,
    morphologies: &'a MorphologyMap,
) -> Result<Vec<(&'a MorphRecord, &'a str)>, BuildError> {
    let mut index: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
    for record in recipe.records() {
        index
            .entry((record.fullmtype.as_str(), record.layer.as_str()))
            .or_default()
            .push(record.etype.as_str());
    }

    let mut joined = Vec::new();
    let mut unmatched = BTreeSet::new();
    for morph in morphologies.records() {
        match index.get(&(morph.fullmtype.as_str(), morph.layer.as_str())) {
            Some(etypes) => joined.extend(etypes.iter().map(|etype| (morph, *etype))),
            None => {
                unmatched.insert((morph.layer.clone(), morph.fullmtype.clone(), morph.name.clone()));
            }
        }
    }
    if !unmatched.is_empty() {
        return Err(BuildError::UnmatchedMorphologies(unmatched.into_iter().collect()));
    }
    Ok(joined)
}

fn join_emodels<'a>(
    joined: &[(&'a MorphRecord, &'a str)],
    resolved: &'a [ResolvedEModel],
) -> Result<Vec<Candidate<'a>>, BuildError> {
    let mut index: HashMap<(&str, &str, &str), Vec<&ResolvedEModel>> = HashMap::new();
    for entry in resolved {
        index
            .entry((entry.layer.as_str(), entry.etype.as_str(), entry.fullmtype.as_str()))
            .or_default()
            .push(entry);
    }

    let mut candidates = Vec::new();
    let mut unmatched = BTreeSet::new();
    for &(morph, etype) in joined {
        let key = (morph.layer.as_str(), etype, morph.fullmtype.as_str());
        match index.get(&key) {
            Some(emodels) => candidates.extend(emodels.iter().map(|&emodel| Candidate {
                morph,
                etype,
                emodel,
            })),
            None => {
                unmatched.insert((morph.layer.clone(), etype.to_string(), morph.fullmtype.clone()));
            }
        }
    }
    if !unmatched.is_empty() {
        return Err(BuildError::UnmatchedEModels(unmatched.into_iter().collect()));
    }
    Ok(candidates)
}

/// Keeps a candidate iff its e-model's morphology pattern matches the morphology name.
fn remove_morph_regex_failures<'a>(
    candidates: Vec<Candidate<'a>>,
    cache: &mut PatternCache,
) -> Result<Vec<Candidate<'a>>, BuildError> {
    let mut kept = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let pattern = cache.get(&candidate.emodel.morph_name_regex)?;
        if pattern.matches(&candidate.morph.name) {
            kept.push(candidate);
        }
    }
    Ok(kept)
}

/// Finds `<dir>/<name><ext>`, trying the declared extension first.
pub fn locate_morphology(dir: &Path, name: &str, declared_ext: Option<&str>) -> Option<String> {
    declared_ext
        .into_iter()
        .chain(MORPHOLOGY_EXTENSIONS)
        .find(|ext| dir.join(format!("{name}{ext}")).is_file())
        .map(str::to_string)
}

/// Two exemplar rows (original id and gating id) per morphology variant: unrepaired,
/// and repaired unless `skip_repaired_exemplar`. Only unrepaired rows carry the
/// optimization-time scores.
fn create_exemplar_rows(inputs: &BuildInputs<'_>) -> Result<Vec<CombinationRow>, BuildError> {
    let mut rows = Vec::new();
    for (original_emodel, entry) in inputs.emodel_map.entries() {
        let definition = inputs.definitions.get(original_emodel)?;
        let (morph_name, declared_ext) = definition.exemplar_morphology(original_emodel)?;
        let declared_ext = Some(declared_ext.as_str()).filter(|e| !e.is_empty());

        let unrep_ext = locate_morphology(inputs.unrep_morph_dir, &morph_name, declared_ext)
            .ok_or_else(|| BuildError::MissingMorphologyFile {
                morph_name: morph_name.clone(),
                dir: inputs.unrep_morph_dir.to_path_buf(),
            })?;
        let mut variants = vec![(false, inputs.unrep_morph_dir, unrep_ext)];

        let morph_info = if inputs.skip_repaired_exemplar {
            None
        } else {
            let info = inputs.morphologies.find(&morph_name).ok_or_else(|| {
                BuildError::MissingExemplarMorphology {
                    emodel: original_emodel.to_string(),
                    morph_name: morph_name.clone(),
                }
            })?;
            let rep_ext = locate_morphology(inputs.rep_morph_dir, &morph_name, declared_ext)
                .ok_or_else(|| BuildError::MissingMorphologyFile {
                    morph_name: morph_name.clone(),
                    dir: inputs.rep_morph_dir.to_path_buf(),
                })?;
            variants.push((true, inputs.rep_morph_dir, rep_ext));
            Some(info)
        };

        for (is_repaired, morph_dir, morph_ext) in variants {
            for (is_original, emodel) in [(true, original_emodel), (false, entry.mm_recipe.as_str())] {
                rows.push(CombinationRow {
                    uid: 0,
                    layer: morph_info.map(|m| m.layer.clone()),
                    fullmtype: morph_info.map(|m| m.fullmtype.clone()),
                    mtype: morph_info.map(|m| m.mtype.clone()),
                    msubtype: morph_info.map(|m| m.msubtype.clone()),
                    etype: definition.etype.clone(),
                    morph_name: morph_name.clone(),
                    morph_ext: morph_ext.clone(),
                    morph_dir: morph_dir.to_path_buf(),
                    emodel: emodel.to_string(),
                    original_emodel: original_emodel.to_string(),
                    scores: None,
                    opt_scores: (!is_repaired).then(|| definition.fitness.clone()),
                    extra_values: None,
                    exception: None,
                    to_run: true,
                    is_exemplar: true,
                    is_repaired,
                    is_original,
                });
            }
        }
    }
    Ok(rows)
}
