#![allow(dead_code)]

//! Two e-models, one layer, two e-types, two morphologies.

use std::path::{Path, PathBuf};

use mecombo::combo::{build_combination_table, BuildError, BuildInputs, CombinationTable};
use mecombo::emodels::{EModelDefinitions, EModelEtypeMap};
use mecombo::morphdb::MorphologyMap;
use mecombo::recipe::Recipe;
use tempfile::{tempdir, TempDir};

pub const RECIPE: &str = "\
layers:
  - id: 1
    percentage: 100.0
    mtypes:
      - id: L1_A
        percentage: 100.0
        etypes:
          - { id: e1, percentage: 50.0 }
          - { id: e2, percentage: 50.0 }
";

pub const NEURONDB: &str = "morph1 1 L1_A\nmorph2 1 L1_A\n";

pub const EMODEL_ETYPE_MAP: &str = r#"{
  "opt_emodel1": {"mm_recipe": "emodel1", "etype": "e1", "layer": ["1"]},
  "opt_emodel2": {"mm_recipe": "emodel2", "etype": "e2", "layer": [1]}
}"#;

pub const FINAL_JSON: &str = r#"{
  "opt_emodel1": {
    "params": {"gnabar_hh": 0.12},
    "fitness": {"Step1.SpikeCount": 1.0},
    "morph_path": "morphologies/morph1.asc",
    "etype": "e1"
  },
  "opt_emodel2": {
    "params": {"gnabar_hh": 0.25},
    "fitness": {"Step1.SpikeCount": 1.0},
    "morph_path": "morphologies/morph1.asc",
    "etype": "e2"
  }
}"#;

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            dir: tempdir().unwrap(),
        };
        fixture.write("recipe.yaml", RECIPE);
        fixture.write("neuronDB.dat", NEURONDB);
        fixture.write("emodel_etype_map.json", EMODEL_ETYPE_MAP);
        fixture.write("final.json", FINAL_JSON);
        fixture.write("repaired/morph1.asc", "");
        fixture.write("repaired/morph2.asc", "");
        fixture.write("unrepaired/morph1.asc", "");
        std::fs::create_dir_all(fixture.path("emodels")).unwrap();
        fixture
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn build(&self, skip_repaired_exemplar: bool) -> Result<CombinationTable, BuildError> {
        let recipe = Recipe::from_path(self.path("recipe.yaml")).unwrap();
        let morphologies = MorphologyMap::from_path(self.path("neuronDB.dat")).unwrap();
        let emodel_map = EModelEtypeMap::from_path(self.path("emodel_etype_map.json")).unwrap();
        let definitions = EModelDefinitions::from_path(self.path("final.json")).unwrap();
        let rep = self.path("repaired");
        let unrep = self.path("unrepaired");
        build_combination_table(&BuildInputs {
            recipe: &recipe,
            morphologies: &morphologies,
            emodel_map: &emodel_map,
            definitions: &definitions,
            rep_morph_dir: &rep,
            unrep_morph_dir: &unrep,
            skip_repaired_exemplar,
        })
    }

    /// Prepare/run config pointing at the fixture files.
    pub fn project_config(&self, scorer_script: &str) -> serde_json::Value {
        serde_json::json!({
            "recipe_path": "recipe.yaml",
            "morph_path": "neuronDB.dat",
            "rep_morph_path": "repaired",
            "unrep_morph_path": "unrepaired",
            "emodel_etype_map_path": "emodel_etype_map.json",
            "final_json_path": "final.json",
            "emodels_dir": "emodels",
            "scores_db": "scores.sqlite",
            "scorer": {
                "program": "/bin/sh",
                "args": ["-c", scorer_script],
                "parallel": 2
            }
        })
    }
}
