//! Builder recipe reader.
//!
//! The recipe assigns probability mass to `(layer, m-type, e-type)` triples. Two
//! document shapes are accepted:
//!
//! ```yaml
//! layers:
//!   - id: 1
//!     percentage: 10.0
//!     mtypes:
//!       - id: L1_DAC
//!         percentage: 50.0
//!         etypes:
//!           - { id: bNAC, percentage: 100.0 }
//! ```
//!
//! or the flat form
//!
//! ```yaml
//! neurons:
//!   - traits: { layer: 1, mtype: L1_DAC, etype: { bNAC: 0.4, cNAC: 0.6 } }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::loose;

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("recipe must define exactly one of `layers` or `neurons`")]
    UnknownShape,
    #[error("zero percentage in recipe at {0}")]
    ZeroPercentage(String),
    #[error("recipe has an empty {field} at {location}")]
    EmptyField {
        field: &'static str,
        location: String,
    },
    #[error("recipe defines no (layer, m-type, e-type) records")]
    Empty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtypeEntry {
    pub id: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MtypeEntry {
    pub id: String,
    pub percentage: f64,
    #[serde(default)]
    pub etypes: Vec<EtypeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerEntry {
    #[serde(deserialize_with = "loose::string")]
    pub id: String,
    pub percentage: f64,
    #[serde(default)]
    pub mtypes: Vec<MtypeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeuronTraits {
    #[serde(deserialize_with = "loose::string")]
    pub layer: String,
    pub mtype: String,
    pub etype: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeuronEntry {
    pub traits: NeuronTraits,
}

/// Parsed recipe document, before flattening.
#[derive(Debug, Clone)]
pub enum RecipeDocument {
    Layers(Vec<LayerEntry>),
    Neurons(Vec<NeuronEntry>),
}

#[derive(Deserialize)]
struct RawRecipe {
    #[serde(default)]
    layers: Option<Vec<LayerEntry>>,
    #[serde(default)]
    neurons: Option<Vec<NeuronEntry>>,
}

impl RecipeDocument {
    pub fn from_yaml_str(text: &str) -> Result<Self, RecipeError> {
        Self::from_raw(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, RecipeError> {
        Self::from_raw(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RecipeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    fn from_raw(raw: RawRecipe) -> Result<Self, RecipeError> {
        match (raw.layers, raw.neurons) {
            (Some(layers), None) => Ok(Self::Layers(layers)),
            (None, Some(neurons)) => Ok(Self::Neurons(neurons)),
            _ => Err(RecipeError::UnknownShape),
        }
    }
}

/// Rejects a recipe in which any percentage, at any level, is exactly zero.
pub fn verify_no_zero_percentage(doc: &RecipeDocument) -> Result<(), RecipeError> {
    match doc {
        RecipeDocument::Layers(layers) => {
            for layer in layers {
                if layer.percentage == 0.0 {
                    return Err(RecipeError::ZeroPercentage(format!("layer {}", layer.id)));
                }
                for mtype in &layer.mtypes {
                    if mtype.percentage == 0.0 {
                        return Err(RecipeError::ZeroPercentage(format!(
                            "layer {} / mtype {}",
                            layer.id, mtype.id
                        )));
                    }
                    for etype in &mtype.etypes {
                        if etype.percentage == 0.0 {
                            return Err(RecipeError::ZeroPercentage(format!(
                                "layer {} / mtype {} / etype {}",
                                layer.id, mtype.id, etype.id
                            )));
                        }
                    }
                }
            }
        }
        RecipeDocument::Neurons(neurons) => {
            for neuron in neurons {
                let traits = &neuron.traits;
                for (etype, probability) in &traits.etype {
                    if *probability == 0.0 {
                        return Err(RecipeError::ZeroPercentage(format!(
                            "layer {} / mtype {} / etype {}",
                            traits.layer, traits.mtype, etype
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecipeRecord {
    pub layer: String,
    pub fullmtype: String,
    pub etype: String,
}

/// Flattened recipe: one record per distinct `(layer, fullmtype, etype)`.
#[derive(Debug, Clone)]
pub struct Recipe {
    records: Vec<RecipeRecord>,
}

impl Recipe {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RecipeError> {
        Self::from_document(&RecipeDocument::from_path(path)?)
    }

    pub fn from_document(doc: &RecipeDocument) -> Result<Self, RecipeError> {
        verify_no_zero_percentage(doc)?;

        let mut triples = Vec::new();
        match doc {
            RecipeDocument::Layers(layers) => {
                for layer in layers {
                    for mtype in &layer.mtypes {
                        for etype in &mtype.etypes {
                            triples.push((layer.id.as_str(), mtype.id.as_str(), etype.id.as_str()));
                        }
                    }
                }
            }
            RecipeDocument::Neurons(neurons) => {
                for neuron in neurons {
                    let traits = &neuron.traits;
                    for etype in traits.etype.keys() {
                        triples.push((traits.layer.as_str(), traits.mtype.as_str(), etype.as_str()));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(triples.len());
        for (layer, fullmtype, etype) in triples {
            let location = format!("layer {layer:?} / mtype {fullmtype:?} / etype {etype:?}");
            for (field, value) in [("layer", layer), ("mtype", fullmtype), ("etype", etype)] {
                if value.trim().is_empty() {
                    return Err(RecipeError::EmptyField { field, location });
                }
            }
            let record = RecipeRecord {
                layer: layer.to_string(),
                fullmtype: fullmtype.to_string(),
                etype: etype.to_string(),
            };
            if seen.insert(record.clone()) {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(RecipeError::Empty);
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[RecipeRecord] {
        &self.records
    }

    pub fn fullmtypes(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.fullmtype.as_str()).collect()
    }

    pub fn etypes(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.etype.as_str()).collect()
    }

    pub fn layers(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.layer.as_str()).collect()
    }

    /// E-types recorded for `(fullmtype, layer)`, in recipe order.
    pub fn etypes_for(&self, fullmtype: &str, layer: &str) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.fullmtype == fullmtype && r.layer == layer)
            .map(|r| r.etype.as_str())
            .collect()
    }

    pub fn contains(&self, layer: &str, fullmtype: &str, etype: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.layer == layer && r.fullmtype == fullmtype && r.etype == etype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYERED: &str = r#"
layers:
  - id: 1
    percentage: 10.0
    mtypes:
      - id: L1_DAC
        percentage: 60.0
        etypes:
          - { id: bNAC, percentage: 30.0 }
          - { id: cNAC, percentage: 70.0 }
  - id: "2"
    percentage: 90.0
    mtypes:
      - id: L23_PC
        percentage: 100.0
        etypes:
          - { id: cADpyr, percentage: 100.0 }
"#;

    #[test]
    fn layered_recipe_flattens_in_order() {
        let recipe = Recipe::from_document(&RecipeDocument::from_yaml_str(LAYERED).unwrap()).unwrap();
        let triples: Vec<_> = recipe
            .records()
            .iter()
            .map(|r| (r.layer.as_str(), r.fullmtype.as_str(), r.etype.as_str()))
            .collect();
        assert_eq!(
            triples,
            vec![
                ("1", "L1_DAC", "bNAC"),
                ("1", "L1_DAC", "cNAC"),
                ("2", "L23_PC", "cADpyr"),
            ]
        );
        assert_eq!(recipe.etypes_for("L1_DAC", "1"), vec!["bNAC", "cNAC"]);
        assert!(recipe.etypes_for("L1_DAC", "2").is_empty());
    }

    #[test]
    fn neurons_recipe_is_accepted() {
        let text = r#"{"neurons": [
            {"traits": {"layer": 5, "mtype": "L5_TPC:A", "etype": {"cADpyr": 1.0}}},
            {"traits": {"layer": 5, "mtype": "L5_TPC:A", "etype": {"cADpyr": 1.0}}}
        ]}"#;
        let recipe = Recipe::from_document(&RecipeDocument::from_json_str(text).unwrap()).unwrap();
        assert_eq!(recipe.records().len(), 1);
        assert!(recipe.contains("5", "L5_TPC:A", "cADpyr"));
    }

    #[test]
    fn zero_percentage_is_rejected_at_every_level() {
        for (needle, replacement) in [
            ("percentage: 10.0", "percentage: 0.0"),
            ("percentage: 60.0", "percentage: 0"),
            ("percentage: 30.0", "percentage: 0.0"),
        ] {
            let doc = RecipeDocument::from_yaml_str(&LAYERED.replace(needle, replacement)).unwrap();
            assert!(matches!(
                verify_no_zero_percentage(&doc),
                Err(RecipeError::ZeroPercentage(_))
            ));
        }
    }

    #[test]
    fn tiny_nonzero_percentage_is_accepted() {
        let doc =
            RecipeDocument::from_yaml_str(&LAYERED.replace("percentage: 30.0", "percentage: 1e-12"))
                .unwrap();
        assert!(verify_no_zero_percentage(&doc).is_ok());
    }

    #[test]
    fn zero_probability_in_neurons_form_is_rejected() {
        let text = r#"{"neurons": [{"traits": {"layer": 1, "mtype": "L1_DAC", "etype": {"bNAC": 0.0}}}]}"#;
        let doc = RecipeDocument::from_json_str(text).unwrap();
        let err = Recipe::from_document(&doc).unwrap_err();
        assert!(err.to_string().contains("bNAC"));
    }

    #[test]
    fn document_needs_exactly_one_shape() {
        assert!(matches!(
            RecipeDocument::from_yaml_str("other: 1"),
            Err(RecipeError::UnknownShape)
        ));
    }
}
