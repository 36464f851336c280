//! Property-based tests for cohorte
//!
//! Mathematical invariants of the deterministic core:
//! - bucketing totality and determinism over arbitrary inputs
//! - targeting evaluation never panics on untrusted expressions
//! - Run with ProptestConfig::with_cases(100)

use std::collections::HashMap;

use cohorte::bucketing::{bucket, is_in_sample, RESOLUTION};
use cohorte::targeting::{AttributeEvaluator, TargetingEvaluator};
use cohorte::{Branch, BucketConfig};
use proptest::prelude::*;

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Generate a branch list with at least one positive ratio.
fn arb_branches() -> impl Strategy<Value = Vec<Branch>> {
    proptest::collection::vec(("[a-z]{1,12}", 0u32..100), 1..8).prop_map(|raw| {
        let mut branches: Vec<Branch> = raw
            .into_iter()
            .enumerate()
            .map(|(i, (slug, ratio))| Branch::new(format!("{slug}-{i}"), ratio))
            .collect();
        // Force a nonzero ratio sum so bucket() has a valid input.
        if branches.iter().all(|b| b.ratio == 0) {
            branches[0].ratio = 1;
        }
        branches
    })
}

fn arb_bucket_config() -> impl Strategy<Value = BucketConfig> {
    ("[a-z]{1,16}", 0u32..10_000, 0u32..10_000).prop_map(|(namespace, start, count)| BucketConfig {
        randomization_unit: "device_id".to_string(),
        namespace,
        start,
        count,
        total: 10_000,
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: bucketing always selects one of the given branches, with a
    /// fraction inside the resolution space.
    #[test]
    fn prop_bucket_total_over_valid_inputs(
        value in ".{0,64}",
        slug in "[a-z-]{1,32}",
        branches in arb_branches(),
    ) {
        let (selected, fraction) = bucket(&value, &slug, &branches).unwrap();
        prop_assert!(branches.iter().any(|b| b.slug == selected));
        prop_assert!(fraction < RESOLUTION);
    }

    /// Property: bucketing is a pure function of its inputs.
    #[test]
    fn prop_bucket_deterministic(
        value in ".{0,64}",
        slug in "[a-z-]{1,32}",
        branches in arb_branches(),
    ) {
        let first = bucket(&value, &slug, &branches).unwrap();
        let second = bucket(&value, &slug, &branches).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Property: a zero-ratio branch is never selected.
    #[test]
    fn prop_zero_ratio_branch_never_selected(
        value in ".{0,64}",
        branches in arb_branches(),
    ) {
        let (selected, _) = bucket(&value, "exp", &branches).unwrap();
        let branch = branches.iter().find(|b| b.slug == selected).unwrap();
        prop_assert!(branch.ratio > 0);
    }

    /// Property: sample membership is deterministic and consistent with the
    /// window arithmetic.
    #[test]
    fn prop_sample_membership_deterministic(
        value in ".{0,64}",
        config in arb_bucket_config(),
    ) {
        let first = is_in_sample(&config, &value);
        let second = is_in_sample(&config, &value);
        prop_assert_eq!(first, second);
        if config.count == 0 {
            prop_assert!(!first);
        }
    }

    /// Property: the evaluator returns a Result on arbitrary input - it never
    /// panics, loops, or recurses unboundedly on untrusted expressions.
    #[test]
    fn prop_targeting_never_panics(expression in ".{0,256}") {
        let attributes = HashMap::from([
            ("app_id".to_string(), "org.example.app".to_string()),
            ("locale".to_string(), "en-US".to_string()),
        ]);
        let _ = AttributeEvaluator::new().evaluate(&expression, &attributes);
    }

    /// Property: well-formed equality expressions evaluate consistently with
    /// the attribute map.
    #[test]
    fn prop_targeting_equality_consistent(value in "[a-zA-Z0-9._-]{0,32}") {
        let attributes = HashMap::from([("locale".to_string(), value.clone())]);
        let expression = format!("locale == '{value}'");
        let result = AttributeEvaluator::new().evaluate(&expression, &attributes).unwrap();
        prop_assert!(result);
    }
}
