//! Morphology database reader.
//!
//! Accepts the whitespace-separated `neurondb.dat` layout (`name layer mtype [msubtype]`,
//! no header) or a JSON/YAML list of `{name, layer, mtype, msubtype?, ext?}` records.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::loose;

#[derive(Debug, thiserror::Error)]
pub enum MorphDbError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("morphology record {index} is missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("morphology {0} is listed more than once with different m-type or layer")]
    Conflicting(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MorphRecord {
    pub name: String,
    pub layer: String,
    pub mtype: String,
    /// Empty when the m-type has no sub-type.
    pub msubtype: String,
    pub fullmtype: String,
    /// File extension including the dot, when the database declares one.
    pub ext: Option<String>,
}

/// `mtype` alone, or `mtype:msubtype` when a sub-type is set.
pub fn fullmtype(mtype: &str, msubtype: &str) -> String {
    if msubtype.is_empty() {
        mtype.to_string()
    } else {
        format!("{mtype}:{msubtype}")
    }
}

#[derive(Debug, Deserialize)]
struct RawMorph {
    #[serde(default)]
    name: String,
    #[serde(default, deserialize_with = "loose::string")]
    layer: String,
    #[serde(default)]
    mtype: String,
    #[serde(default)]
    msubtype: Option<String>,
    #[serde(default)]
    ext: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MorphologyMap {
    records: Vec<MorphRecord>,
    by_name: HashMap<String, usize>,
}

impl MorphologyMap {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MorphDbError> {
        let path = path.as_ref();
        let io_err = |source| MorphDbError::Io {
            path: path.to_path_buf(),
            source,
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                let text = std::fs::read_to_string(path).map_err(io_err)?;
                Self::from_raw(serde_json::from_str(&text)?)
            }
            Some("yaml") | Some("yml") => {
                let text = std::fs::read_to_string(path).map_err(io_err)?;
                Self::from_raw(serde_yaml::from_str(&text)?)
            }
            _ => {
                let file = std::fs::File::open(path).map_err(io_err)?;
                Self::from_dat_reader(file)
            }
        }
    }

    /// Reads the whitespace-separated layout. Runs of spaces count as one separator.
    pub fn from_dat_reader<R: Read>(reader: R) -> Result<Self, MorphDbError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut raw = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let fields: Vec<&str> = record
                .iter()
                .flat_map(|f| f.split('\t'))
                .filter(|f| !f.is_empty())
                .collect();
            if fields.is_empty() || fields[0].starts_with('#') {
                continue;
            }
            let (mtype, msubtype) = match fields.get(2) {
                Some(m) => match (m.split_once(':'), fields.get(3)) {
                    (Some((mtype, sub)), _) => (mtype.to_string(), Some(sub.to_string())),
                    (None, Some(sub)) => (m.to_string(), Some(sub.to_string())),
                    (None, None) => (m.to_string(), None),
                },
                None => (String::new(), None),
            };
            raw.push(RawMorph {
                name: fields[0].to_string(),
                layer: fields.get(1).map(|s| s.to_string()).unwrap_or_default(),
                mtype,
                msubtype,
                ext: None,
            });
        }
        Self::from_raw(raw)
    }

    fn from_raw(raw: Vec<RawMorph>) -> Result<Self, MorphDbError> {
        let mut map = Self::default();
        for (index, item) in raw.into_iter().enumerate() {
            for (field, value) in [
                ("name", &item.name),
                ("layer", &item.layer),
                ("mtype", &item.mtype),
            ] {
                if value.trim().is_empty() {
                    return Err(MorphDbError::MissingField { index, field });
                }
            }
            let msubtype = item.msubtype.unwrap_or_default();
            let ext = item
                .ext
                .filter(|e| !e.is_empty())
                .map(|e| if e.starts_with('.') { e } else { format!(".{e}") });
            let record = MorphRecord {
                fullmtype: fullmtype(&item.mtype, &msubtype),
                name: item.name,
                layer: item.layer,
                mtype: item.mtype,
                msubtype,
                ext,
            };
            map.push(record)?;
        }
        Ok(map)
    }

    fn push(&mut self, record: MorphRecord) -> Result<(), MorphDbError> {
        if let Some(&idx) = self.by_name.get(&record.name) {
            let existing = &self.records[idx];
            if existing.fullmtype != record.fullmtype || existing.layer != record.layer {
                return Err(MorphDbError::Conflicting(record.name));
            }
            return Ok(());
        }
        self.by_name.insert(record.name.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[MorphRecord] {
        &self.records
    }

    pub fn find(&self, name: &str) -> Option<&MorphRecord> {
        self.by_name.get(name).map(|&idx| &self.records[idx])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dat_layout_splits_composite_mtypes() {
        let dat = "morph1 1 L1_DAC\nmorph2  5   L5_TPC:A\n\nmorph3 5 L5_TPC B\n";
        let map = MorphologyMap::from_dat_reader(dat.as_bytes()).unwrap();
        assert_eq!(map.len(), 3);

        let m1 = map.find("morph1").unwrap();
        assert_eq!((m1.layer.as_str(), m1.fullmtype.as_str()), ("1", "L1_DAC"));
        assert_eq!(m1.msubtype, "");

        let m2 = map.find("morph2").unwrap();
        assert_eq!(m2.mtype, "L5_TPC");
        assert_eq!(m2.msubtype, "A");
        assert_eq!(m2.fullmtype, "L5_TPC:A");

        assert_eq!(map.find("morph3").unwrap().fullmtype, "L5_TPC:B");
    }

    #[test]
    fn missing_column_is_a_schema_error() {
        let err = MorphologyMap::from_dat_reader("morph1 1\n".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            MorphDbError::MissingField {
                index: 0,
                field: "mtype"
            }
        ));
    }

    #[test]
    fn json_records_keep_declared_extension() {
        let raw: Vec<RawMorph> = serde_json::from_str(
            r#"[{"name": "m1", "layer": 2, "mtype": "L23_PC", "ext": "swc"},
                {"name": "m2", "layer": "2", "mtype": "L23_PC", "msubtype": ""}]"#,
        )
        .unwrap();
        let map = MorphologyMap::from_raw(raw).unwrap();
        assert_eq!(map.find("m1").unwrap().ext.as_deref(), Some(".swc"));
        assert_eq!(map.find("m2").unwrap().fullmtype, "L23_PC");
    }

    #[test]
    fn conflicting_duplicate_is_rejected() {
        let dat = "morph1 1 L1_DAC\nmorph1 2 L1_DAC\n";
        assert!(matches!(
            MorphologyMap::from_dat_reader(dat.as_bytes()),
            Err(MorphDbError::Conflicting(_))
        ));
    }
}
