//! Serde helpers for identifiers that input files write either as numbers or strings.

use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseId {
    Int(i64),
    Float(f64),
    Str(String),
}

impl LooseId {
    fn into_string(self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => (v as i64).to_string(),
            Self::Float(v) => v.to_string(),
            Self::Str(s) => s.trim().to_string(),
        }
    }
}

/// Layer ids show up as `1`, `1.0` or `"1"`; all of them normalise to `"1"`.
pub(crate) fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    LooseId::deserialize(deserializer).map(LooseId::into_string)
}

pub(crate) fn strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<LooseId>),
        One(LooseId),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(ids) => ids.into_iter().map(LooseId::into_string).collect(),
        OneOrMany::One(id) => vec![id.into_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "string")]
        layer: String,
        #[serde(deserialize_with = "strings")]
        layers: Vec<String>,
    }

    #[test]
    fn numbers_and_strings_normalise_to_the_same_id() {
        let a: Holder = serde_json::from_str(r#"{"layer": 1, "layers": [1, "2", 3.0]}"#).unwrap();
        assert_eq!(a.layer, "1");
        assert_eq!(a.layers, vec!["1", "2", "3"]);

        let b: Holder = serde_json::from_str(r#"{"layer": " 1 ", "layers": 4}"#).unwrap();
        assert_eq!(b.layer, "1");
        assert_eq!(b.layers, vec!["4"]);
    }
}
