//! Experiment - the root catalog entity

use serde::{Deserialize, Serialize};

use super::Branch;

/// Resolution of the bucketing space shared by default with the server side.
const DEFAULT_BUCKET_TOTAL: u32 = 10_000;

/// A server-defined experiment offering one or more branches to a population.
///
/// Experiments are immutable once received and replaced wholesale on each
/// fetch/apply cycle. The JSON schema is shared between the remote catalog
/// source and [`set_experiments_locally`](crate::client::ExperimentClient::set_experiments_locally).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    /// Unique experiment key.
    pub slug: String,
    /// Human-readable experiment name.
    #[serde(default)]
    pub user_facing_name: String,
    /// Human-readable experiment description.
    #[serde(default)]
    pub user_facing_description: String,
    /// Ordered branch list; bucketing walks this order.
    pub branches: Vec<Branch>,
    /// Optional eligibility predicate, evaluated against the app context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<String>,
    /// Which randomization unit to hash and how to sample the population.
    pub bucket_config: BucketConfig,
    /// When true, no new devices enroll; existing enrollments are kept.
    #[serde(default)]
    pub is_enrollment_paused: bool,
}

impl Experiment {
    /// Create a builder for an experiment.
    ///
    /// Mostly useful in tests and for `set_experiments_locally` payloads
    /// constructed in code; production catalogs arrive as JSON.
    #[must_use]
    pub fn builder(slug: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(slug)
    }

    /// Whether the experiment has a branch with the given slug.
    #[must_use]
    pub fn has_branch(&self, branch_slug: &str) -> bool {
        self.branches.iter().any(|b| b.slug == branch_slug)
    }

    /// Look up a branch by slug.
    #[must_use]
    pub fn get_branch(&self, branch_slug: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.slug == branch_slug)
    }
}

/// Bucketing configuration: which randomization unit to hash, the namespace
/// salt, and the population sampling window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    /// Name of the randomization unit used as hash input.
    pub randomization_unit: String,
    /// Namespacing salt so distinct experiments sample independently.
    pub namespace: String,
    /// First bucket of the sampling window.
    #[serde(default)]
    pub start: u32,
    /// Number of buckets in the sampling window.
    pub count: u32,
    /// Size of the bucket space; `count == total` samples everyone.
    #[serde(default = "default_bucket_total")]
    pub total: u32,
}

const fn default_bucket_total() -> u32 {
    DEFAULT_BUCKET_TOTAL
}

impl BucketConfig {
    /// A window covering the whole population for the given unit/namespace.
    #[must_use]
    pub fn full_population(
        randomization_unit: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            randomization_unit: randomization_unit.into(),
            namespace: namespace.into(),
            start: 0,
            count: DEFAULT_BUCKET_TOTAL,
            total: DEFAULT_BUCKET_TOTAL,
        }
    }
}

/// Builder for [`Experiment`].
#[derive(Debug)]
pub struct ExperimentBuilder {
    slug: String,
    user_facing_name: String,
    user_facing_description: String,
    branches: Vec<Branch>,
    targeting: Option<String>,
    bucket_config: Option<BucketConfig>,
    is_enrollment_paused: bool,
}

impl ExperimentBuilder {
    /// Create a new builder with the required slug.
    #[must_use]
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            user_facing_name: String::new(),
            user_facing_description: String::new(),
            branches: Vec::new(),
            targeting: None,
            bucket_config: None,
            is_enrollment_paused: false,
        }
    }

    /// Set the user-facing name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.user_facing_name = name.into();
        self
    }

    /// Set the user-facing description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.user_facing_description = description.into();
        self
    }

    /// Append a branch. Order is significant.
    #[must_use]
    pub fn branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Set the targeting expression.
    #[must_use]
    pub fn targeting(mut self, expression: impl Into<String>) -> Self {
        self.targeting = Some(expression.into());
        self
    }

    /// Set the bucketing configuration.
    #[must_use]
    pub fn bucket_config(mut self, config: BucketConfig) -> Self {
        self.bucket_config = Some(config);
        self
    }

    /// Pause new enrollments.
    #[must_use]
    pub const fn enrollment_paused(mut self, paused: bool) -> Self {
        self.is_enrollment_paused = paused;
        self
    }

    /// Build the [`Experiment`].
    ///
    /// A missing bucket config defaults to a full-population window over the
    /// `device_id` unit, namespaced by the experiment slug.
    #[must_use]
    pub fn build(self) -> Experiment {
        let bucket_config = self.bucket_config.unwrap_or_else(|| {
            BucketConfig::full_population(crate::catalog::DEVICE_ID_UNIT, self.slug.clone())
        });
        Experiment {
            slug: self.slug,
            user_facing_name: self.user_facing_name,
            user_facing_description: self.user_facing_description,
            branches: self.branches,
            targeting: self.targeting,
            bucket_config,
            is_enrollment_paused: self.is_enrollment_paused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_builder_defaults() {
        let exp = Experiment::builder("exp-1")
            .branch(Branch::new("control", 1))
            .branch(Branch::new("treatment", 1))
            .build();

        assert_eq!(exp.slug, "exp-1");
        assert_eq!(exp.branches.len(), 2);
        assert!(!exp.is_enrollment_paused);
        assert_eq!(exp.bucket_config.namespace, "exp-1");
        assert_eq!(exp.bucket_config.count, exp.bucket_config.total);
    }

    #[test]
    fn test_has_branch_and_get_branch() {
        let exp = Experiment::builder("exp-1")
            .branch(Branch::new("control", 1))
            .build();

        assert!(exp.has_branch("control"));
        assert!(!exp.has_branch("treatment"));
        assert_eq!(exp.get_branch("control").map(|b| b.ratio), Some(1));
    }

    #[test]
    fn test_experiment_json_schema_round_trip() {
        let json = serde_json::json!({
            "slug": "secure-gold",
            "userFacingName": "Diagnostic test experiment",
            "userFacingDescription": "A test experiment.",
            "branches": [
                {"slug": "control", "ratio": 1},
                {"slug": "treatment", "ratio": 1}
            ],
            "targeting": "app_id == 'org.example.app'",
            "bucketConfig": {
                "randomizationUnit": "device_id",
                "namespace": "secure-gold",
                "start": 0,
                "count": 10_000,
                "total": 10_000
            },
            "isEnrollmentPaused": false
        });

        let exp: Experiment = serde_json::from_value(json).expect("schema should parse");
        assert_eq!(exp.slug, "secure-gold");
        assert_eq!(exp.bucket_config.randomization_unit, "device_id");

        let back = serde_json::to_value(&exp).unwrap();
        assert_eq!(back["bucketConfig"]["namespace"], "secure-gold");
    }

    #[test]
    fn test_minimal_schema_applies_defaults() {
        let json = serde_json::json!({
            "slug": "minimal",
            "branches": [{"slug": "only", "ratio": 1}],
            "bucketConfig": {
                "randomizationUnit": "device_id",
                "namespace": "minimal",
                "count": 10_000
            }
        });

        let exp: Experiment = serde_json::from_value(json).expect("minimal schema should parse");
        assert_eq!(exp.bucket_config.start, 0);
        assert_eq!(exp.bucket_config.total, 10_000);
        assert!(exp.targeting.is_none());
        assert!(!exp.is_enrollment_paused);
    }
}
