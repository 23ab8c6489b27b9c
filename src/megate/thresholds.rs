//! Ordered threshold rules.
//!
//! Each rule selects combinations by `(emodel, fullmtype, etype)` and features by
//! name. Rules are evaluated in declaration order and a later match overrides an
//! earlier one for the same feature.

use serde::{Deserialize, Serialize};

use crate::pattern::{AnyOf, PatternCache, PatternError, PatternList};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRuleSpec {
    #[serde(default)]
    pub emodel: PatternList,
    #[serde(default)]
    pub fullmtype: PatternList,
    #[serde(default)]
    pub etype: PatternList,
    #[serde(default)]
    pub features: PatternList,
    pub megate_threshold: f64,
}

#[derive(Debug, Clone)]
struct ThresholdRule {
    emodel: AnyOf,
    fullmtype: AnyOf,
    etype: AnyOf,
    features: AnyOf,
    threshold: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdRules {
    rules: Vec<ThresholdRule>,
}

impl ThresholdRules {
    pub fn compile(
        specs: &[ThresholdRuleSpec],
        cache: &mut PatternCache,
    ) -> Result<Self, PatternError> {
        let rules = specs
            .iter()
            .map(|spec| {
                Ok(ThresholdRule {
                    emodel: spec.emodel.compile(cache)?,
                    fullmtype: spec.fullmtype.compile(cache)?,
                    etype: spec.etype.compile(cache)?,
                    features: spec.features.compile(cache)?,
                    threshold: spec.megate_threshold,
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules applying to one combination, still in declaration order.
    pub fn for_combination(&self, emodel: &str, fullmtype: &str, etype: &str) -> FeatureThresholds<'_> {
        FeatureThresholds {
            rules: self
                .rules
                .iter()
                .filter(|r| {
                    r.emodel.matches(emodel) && r.fullmtype.matches(fullmtype) && r.etype.matches(etype)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureThresholds<'a> {
    rules: Vec<&'a ThresholdRule>,
}

impl FeatureThresholds<'_> {
    /// Threshold of the last rule whose feature pattern matches, if any.
    pub fn threshold_for(&self, feature: &str) -> Option<f64> {
        self.rules
            .iter()
            .filter(|rule| rule.features.matches(feature))
            .fold(None, |_, rule| Some(rule.threshold))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
