//! Branch - one weighted variant of an experiment

use serde::{Deserialize, Serialize};

/// One variant of an experiment with a relative weight and an optional
/// feature configuration.
///
/// Branch order matters: deterministic bucketing walks branches in catalog
/// order, so reordering branches reshuffles assignments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    /// Branch identifier, unique within its experiment.
    pub slug: String,
    /// Relative weight of this branch. The sum across an experiment's
    /// branches must be greater than zero.
    pub ratio: u32,
    /// Feature toggled by this branch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<FeatureConfig>,
}

impl Branch {
    /// Create a branch with the given slug and ratio.
    #[must_use]
    pub fn new(slug: impl Into<String>, ratio: u32) -> Self {
        Self {
            slug: slug.into(),
            ratio,
            feature: None,
        }
    }

    /// Attach a feature configuration.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureConfig) -> Self {
        self.feature = Some(feature);
        self
    }
}

/// Feature switch carried by a branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConfig {
    /// Identifier of the feature the branch controls.
    pub feature_id: String,
    /// Whether the feature is enabled for devices on this branch.
    pub enabled: bool,
}
