//! Prepare phase: reads every input, builds the combination table and persists it
//! together with the e-model definitions the run phase needs.

use serde::Serialize;
use tracing::info;

use crate::combo::{build_combination_table, BuildError, BuildInputs};
use crate::config::ProjectConfig;
use crate::emodels::{EModelDefinitions, EModelError, EModelEtypeMap};
use crate::morphdb::{MorphDbError, MorphologyMap};
use crate::recipe::{Recipe, RecipeError};
use crate::store::{ComboStore, PersistedEModel, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("recipe: {0}")]
    Recipe(#[from] RecipeError),
    #[error("morphology database: {0}")]
    MorphDb(#[from] MorphDbError),
    #[error("e-models: {0}")]
    EModel(#[from] EModelError),
    #[error("combination table: {0}")]
    Build(#[from] BuildError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrepareSummary {
    pub rows: usize,
    pub exemplars: usize,
    pub emodels: usize,
}

pub async fn prepare_combos(
    config: &ProjectConfig,
    store: &ComboStore,
    replace: bool,
) -> Result<PrepareSummary, PrepareError> {
    let recipe = Recipe::from_path(&config.recipe_path)?;
    let morphologies = MorphologyMap::from_path(&config.morph_path)?;
    let emodel_map = EModelEtypeMap::from_path(&config.emodel_etype_map_path)?;
    let definitions = EModelDefinitions::from_path(&config.final_json_path)?;
    info!(
        recipe = recipe.records().len(),
        morphologies = morphologies.len(),
        emodels = emodel_map.len(),
        "inputs loaded"
    );

    let table = build_combination_table(&BuildInputs {
        recipe: &recipe,
        morphologies: &morphologies,
        emodel_map: &emodel_map,
        definitions: &definitions,
        rep_morph_dir: &config.rep_morph_path,
        unrep_morph_dir: &config.unrep_morph_path,
        skip_repaired_exemplar: config.skip_repaired_exemplar,
    })?;

    let emodels = emodel_map
        .entries()
        .map(|(original_emodel, _)| {
            Ok(PersistedEModel {
                original_emodel: original_emodel.to_string(),
                emodel_dir: definitions.emodel_dir(original_emodel, config.emodels_dir.as_deref())?,
                params: definitions.get(original_emodel)?.params.clone(),
            })
        })
        .collect::<Result<Vec<_>, EModelError>>()?;

    let summary = PrepareSummary {
        rows: table.len(),
        exemplars: table.exemplar_count(),
        emodels: emodels.len(),
    };
    store.write_table(&table, replace).await?;
    store.write_emodels(emodels).await?;
    info!(rows = summary.rows, db = %store.path().display(), "combination table stored");
    Ok(summary)
}
