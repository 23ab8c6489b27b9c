//! Start-anchored regex matching used by every name filter in the pipeline.
//!
//! A pattern matches when it matches a prefix of the text; trailing characters
//! are allowed. `morph1` therefore accepts `morph10`. Callers that want a full
//! match write the trailing `$` themselves.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MATCH_ALL: &str = ".*";

#[derive(Debug, thiserror::Error)]
#[error("invalid pattern {pattern:?}: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Compiled patterns keyed by their source string.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: HashMap<String, Pattern>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, pattern: &str) -> Result<Pattern, PatternError> {
        if let Some(found) = self.compiled.get(pattern) {
            return Ok(found.clone());
        }
        let compiled = Pattern::new(pattern)?;
        self.compiled.insert(pattern.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// One pattern or a list of alternatives, as written in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternList {
    One(String),
    Many(Vec<String>),
}

impl Default for PatternList {
    fn default() -> Self {
        Self::One(MATCH_ALL.to_string())
    }
}

impl PatternList {
    pub fn sources(&self) -> Vec<&str> {
        match self {
            Self::One(p) => vec![p.as_str()],
            Self::Many(ps) => ps.iter().map(String::as_str).collect(),
        }
    }

    pub fn compile(&self, cache: &mut PatternCache) -> Result<AnyOf, PatternError> {
        let patterns = self
            .sources()
            .into_iter()
            .map(|p| cache.get(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AnyOf { patterns })
    }
}

/// Matches when any member matches. An empty list matches nothing.
#[derive(Debug, Clone)]
pub struct AnyOf {
    patterns: Vec<Pattern>,
}

impl AnyOf {
    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(text))
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_is_anchored_at_start_only() {
        let p = Pattern::new("morph1").unwrap();
        assert!(p.matches("morph1"));
        // Prefix match is accepted: `morph1` also selects `morph10`.
        assert!(p.matches("morph10"));
        assert!(!p.matches("xmorph1"));

        let exact = Pattern::new("morph1$").unwrap();
        assert!(!exact.matches("morph10"));
    }

    #[test]
    fn alternation_stays_anchored() {
        let p = Pattern::new("bAC|cAD").unwrap();
        assert!(p.matches("cADpyr"));
        assert!(!p.matches("L5_cAD"));
    }

    #[test]
    fn cache_compiles_each_source_once() {
        let mut cache = PatternCache::new();
        cache.get(".*").unwrap();
        cache.get(".*").unwrap();
        cache.get("L1_.*").unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalid_pattern_reports_source() {
        let err = Pattern::new("(unclosed").unwrap_err();
        assert_eq!(err.pattern, "(unclosed");
    }

    #[test]
    fn pattern_list_accepts_string_or_list() {
        let one: PatternList = serde_json::from_str(r#""L5_.*""#).unwrap();
        let many: PatternList = serde_json::from_str(r#"["L4_.*", "L5_.*"]"#).unwrap();
        let mut cache = PatternCache::new();
        assert!(one.compile(&mut cache).unwrap().matches("L5_TPC"));
        let any = many.compile(&mut cache).unwrap();
        assert!(any.matches("L4_SS"));
        assert!(!any.matches("L6_BP"));
        assert!(PatternList::default().compile(&mut cache).unwrap().matches(""));
    }
}
