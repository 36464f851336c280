//! The enrollment diff engine
//!
//! [`EnrollmentsEvolver`] computes the transition between a previous
//! enrollment snapshot and a newly fetched catalog. It holds only borrowed
//! inputs for a single diff computation and never caches across calls; every
//! public client operation re-reads persisted state first.
//!
//! Partial-failure containment: a targeting or bucketing failure in one
//! experiment converts into that experiment's outcome (ineligibility, a
//! disqualification, or a skip) and never aborts processing of the others.

use std::collections::{BTreeSet, HashMap};

use crate::bucketing;
use crate::catalog::{Experiment, RandomizationUnits};
use crate::targeting::TargetingEvaluator;
use crate::{Error, Result};

use super::events::EnrollmentChangeEvent;
use super::record::{
    DisqualifiedReason, EnrolledReason, EnrollmentStatus, ExperimentEnrollment, NotEnrolledReason,
};

/// Computes enrollment transitions for one catalog update.
pub struct EnrollmentsEvolver<'a> {
    device_id: &'a str,
    randomization_units: &'a RandomizationUnits,
    attributes: &'a HashMap<String, String>,
    evaluator: &'a dyn TargetingEvaluator,
}

impl<'a> EnrollmentsEvolver<'a> {
    /// Create an evolver borrowing the device identity and evaluator.
    #[must_use]
    pub fn new(
        device_id: &'a str,
        randomization_units: &'a RandomizationUnits,
        attributes: &'a HashMap<String, String>,
        evaluator: &'a dyn TargetingEvaluator,
    ) -> Self {
        Self {
            device_id,
            randomization_units,
            attributes,
            evaluator,
        }
    }

    /// Compute the new enrollment set and its audit events.
    ///
    /// Processes the union of previous catalog, next catalog, and existing
    /// records in ascending slug order, so the returned events are
    /// deterministic for a given input.
    ///
    /// # Errors
    /// Only internal invariant violations abort the diff; per-experiment
    /// evaluation failures are contained.
    pub fn evolve_enrollments(
        &self,
        is_user_participating: bool,
        prev_experiments: &[Experiment],
        next_experiments: &[Experiment],
        existing_enrollments: &[ExperimentEnrollment],
    ) -> Result<(Vec<ExperimentEnrollment>, Vec<EnrollmentChangeEvent>)> {
        let prev_map = map_experiments(prev_experiments);
        let next_map = map_experiments(next_experiments);
        let record_map = map_enrollments(existing_enrollments);

        // BTreeSet fixes the ascending slug order of both records and events.
        let mut all_slugs: BTreeSet<&str> = BTreeSet::new();
        all_slugs.extend(prev_map.keys());
        all_slugs.extend(next_map.keys());
        all_slugs.extend(record_map.keys());

        let mut events = Vec::new();
        let mut updated = Vec::with_capacity(all_slugs.len());
        for slug in all_slugs {
            let next = self.evolve_enrollment(
                is_user_participating,
                prev_map.get(slug).copied(),
                next_map.get(slug).copied(),
                record_map.get(slug).copied(),
                &mut events,
            )?;
            if let Some(record) = next {
                updated.push(record);
            }
        }
        Ok((updated, events))
    }

    /// Evolve a single enrollment from the previous and next state of its
    /// experiment. `None` means the record is deleted (or never created).
    pub(crate) fn evolve_enrollment(
        &self,
        is_user_participating: bool,
        prev_experiment: Option<&Experiment>,
        next_experiment: Option<&Experiment>,
        existing_enrollment: Option<&ExperimentEnrollment>,
        out_events: &mut Vec<EnrollmentChangeEvent>,
    ) -> Result<Option<ExperimentEnrollment>> {
        Ok(
            match (prev_experiment, next_experiment, existing_enrollment) {
                // New experiment.
                (None, Some(experiment), None) => {
                    self.from_new_experiment(is_user_participating, experiment, out_events)
                }
                // Experiment removed from the catalog.
                (Some(_), None, Some(enrollment)) => enrollment.on_experiment_ended(out_events),
                // Continuing experiment.
                (_, Some(experiment), Some(enrollment)) => Some(self.on_experiment_updated(
                    enrollment,
                    is_user_participating,
                    experiment,
                    out_events,
                )),
                // Record outlived its experiment on both sides (WasEnrolled).
                (None, None, Some(enrollment)) => enrollment.maybe_garbage_collect(),
                // The previous apply skipped this experiment as malformed and
                // wrote no record; evaluate it like a new experiment.
                (Some(_), Some(experiment), None) => {
                    tracing::warn!(
                        slug = %experiment.slug,
                        "experiment had no enrollment record, re-evaluating"
                    );
                    self.from_new_experiment(is_user_participating, experiment, out_events)
                }
                (Some(experiment), None, None) => {
                    tracing::warn!(
                        slug = %experiment.slug,
                        "removed experiment had no enrollment record"
                    );
                    None
                }
                (None, None, None) => {
                    return Err(Error::Internal("evolved a slug with no experiment or record"))
                }
            },
        )
    }

    /// Evaluate an experiment seen for the first time.
    fn from_new_experiment(
        &self,
        is_user_participating: bool,
        experiment: &Experiment,
        out_events: &mut Vec<EnrollmentChangeEvent>,
    ) -> Option<ExperimentEnrollment> {
        if !is_user_participating {
            return Some(not_enrolled(&experiment.slug, NotEnrolledReason::OptOut));
        }
        if experiment.is_enrollment_paused {
            return Some(not_enrolled(
                &experiment.slug,
                NotEnrolledReason::EnrollmentsPaused,
            ));
        }
        match self.evaluate_enrollment(experiment) {
            Ok(enrollment) => {
                tracing::debug!(slug = %experiment.slug, status = ?enrollment.status, "new experiment evaluated");
                if enrollment.status.is_enrolled() {
                    out_events.push(enrollment.change_event());
                }
                Some(enrollment)
            }
            Err(error) => {
                // Degenerate configuration (e.g. zero ratios): skip this
                // experiment, leave the rest of the batch untouched.
                tracing::warn!(slug = %experiment.slug, %error, "skipping malformed experiment");
                None
            }
        }
    }

    /// Re-evaluate an experiment we already hold a record for.
    fn on_experiment_updated(
        &self,
        record: &ExperimentEnrollment,
        is_user_participating: bool,
        experiment: &Experiment,
        out_events: &mut Vec<EnrollmentChangeEvent>,
    ) -> ExperimentEnrollment {
        match &record.status {
            EnrollmentStatus::NotEnrolled { .. } => {
                if !is_user_participating || experiment.is_enrollment_paused {
                    return record.clone();
                }
                match self.evaluate_enrollment(experiment) {
                    Ok(enrollment) => {
                        if enrollment.status.is_enrolled() {
                            out_events.push(enrollment.change_event());
                        }
                        enrollment
                    }
                    Err(error) => {
                        tracing::warn!(slug = %experiment.slug, %error, "keeping previous record for malformed experiment");
                        record.clone()
                    }
                }
            }
            EnrollmentStatus::Enrolled {
                enrollment_id,
                branch,
                ..
            } => {
                if !is_user_participating {
                    return disqualified(
                        record,
                        *enrollment_id,
                        branch,
                        DisqualifiedReason::OptOut,
                        out_events,
                    );
                }
                if !experiment.has_branch(branch) {
                    // The branch we were assigned to disappeared.
                    return disqualified(
                        record,
                        *enrollment_id,
                        branch,
                        DisqualifiedReason::Error,
                        out_events,
                    );
                }
                match self.evaluate_enrollment(experiment) {
                    Ok(evaluated) => match evaluated.status {
                        EnrollmentStatus::NotEnrolled {
                            reason: NotEnrolledReason::NotTargeted,
                        } => disqualified(
                            record,
                            *enrollment_id,
                            branch,
                            DisqualifiedReason::NotTargeted,
                            out_events,
                        ),
                        EnrollmentStatus::NotEnrolled {
                            reason: NotEnrolledReason::Error,
                        } => disqualified(
                            record,
                            *enrollment_id,
                            branch,
                            DisqualifiedReason::Error,
                            out_events,
                        ),
                        // Re-bucketing never moves an enrolled device, and a
                        // shrunk sampling window never evicts one.
                        _ => record.clone(),
                    },
                    Err(_) => disqualified(
                        record,
                        *enrollment_id,
                        branch,
                        DisqualifiedReason::Error,
                        out_events,
                    ),
                }
            }
            EnrollmentStatus::Disqualified {
                enrollment_id,
                branch,
                ..
            } => {
                if is_user_participating {
                    record.clone()
                } else {
                    ExperimentEnrollment::new(
                        record.slug.clone(),
                        EnrollmentStatus::Disqualified {
                            enrollment_id: *enrollment_id,
                            reason: DisqualifiedReason::OptOut,
                            branch: branch.clone(),
                        },
                    )
                }
            }
            EnrollmentStatus::WasEnrolled { .. } => record.clone(),
        }
    }

    /// Run targeting, sampling, and branch bucketing for one experiment.
    ///
    /// Eligibility failures (targeting miss or error, missing unit, out of
    /// sample) come back as `NotEnrolled` statuses. Only a degenerate branch
    /// configuration is a hard error, left to the caller's containment.
    fn evaluate_enrollment(&self, experiment: &Experiment) -> Result<ExperimentEnrollment> {
        let slug = &experiment.slug;

        if let Some(expression) = &experiment.targeting {
            match self.evaluator.evaluate(expression, self.attributes) {
                Ok(true) => {}
                Ok(false) => return Ok(not_enrolled(slug, NotEnrolledReason::NotTargeted)),
                Err(error) => {
                    tracing::warn!(slug = %slug, %error, "targeting failed, experiment ineligible");
                    return Ok(not_enrolled(slug, NotEnrolledReason::Error));
                }
            }
        }

        let unit = &experiment.bucket_config.randomization_unit;
        let Some(value) = self.randomization_units.resolve(self.device_id, unit) else {
            let error = Error::MissingRandomizationUnit(unit.clone(), slug.clone());
            tracing::warn!(%error, "experiment ineligible");
            return Ok(not_enrolled(slug, NotEnrolledReason::Error));
        };

        if !bucketing::is_in_sample(&experiment.bucket_config, value) {
            return Ok(not_enrolled(slug, NotEnrolledReason::NotSelected));
        }

        let (branch, _fraction) = bucketing::bucket(value, slug, &experiment.branches)?;
        Ok(ExperimentEnrollment::new(
            slug.clone(),
            EnrollmentStatus::new_enrolled(EnrolledReason::Qualified, &branch),
        ))
    }
}

fn not_enrolled(slug: &str, reason: NotEnrolledReason) -> ExperimentEnrollment {
    ExperimentEnrollment::new(slug, EnrollmentStatus::NotEnrolled { reason })
}

fn disqualified(
    record: &ExperimentEnrollment,
    enrollment_id: uuid::Uuid,
    branch: &str,
    reason: DisqualifiedReason,
    out_events: &mut Vec<EnrollmentChangeEvent>,
) -> ExperimentEnrollment {
    tracing::debug!(slug = %record.slug, ?reason, "enrollment disqualified");
    let updated = ExperimentEnrollment::new(
        record.slug.clone(),
        EnrollmentStatus::Disqualified {
            enrollment_id,
            reason,
            branch: branch.to_string(),
        },
    );
    out_events.push(updated.change_event());
    updated
}

fn map_experiments(experiments: &[Experiment]) -> HashMap<&str, &Experiment> {
    experiments.iter().map(|e| (e.slug.as_str(), e)).collect()
}

fn map_enrollments(enrollments: &[ExperimentEnrollment]) -> HashMap<&str, &ExperimentEnrollment> {
    enrollments.iter().map(|e| (e.slug.as_str(), e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AppContext, Branch, BucketConfig};
    use crate::enrollment::events::EnrollmentChangeEventType;
    use crate::targeting::AttributeEvaluator;

    const DEVICE_ID: &str = "29686b11-00c0-4905-b5e4-f5f945eda60a";

    fn test_experiment(slug: &str) -> Experiment {
        Experiment::builder(slug)
            .name("Diagnostic test experiment")
            .branch(Branch::new("control", 1))
            .branch(Branch::new("treatment", 1))
            .bucket_config(BucketConfig::full_population("device_id", slug))
            .build()
    }

    struct Fixture {
        units: RandomizationUnits,
        attributes: HashMap<String, String>,
        evaluator: AttributeEvaluator,
    }

    impl Fixture {
        fn new() -> Self {
            let ctx = AppContext {
                app_id: "org.example.app".to_string(),
                locale: Some("en-US".to_string()),
                ..Default::default()
            };
            Self {
                units: RandomizationUnits::new(),
                attributes: ctx.as_attributes(),
                evaluator: AttributeEvaluator::new(),
            }
        }

        fn evolver(&self) -> EnrollmentsEvolver<'_> {
            EnrollmentsEvolver::new(DEVICE_ID, &self.units, &self.attributes, &self.evaluator)
        }
    }

    #[test]
    fn test_new_experiment_enrolls() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert!(record.status.is_enrolled());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change, EnrollmentChangeEventType::Enrollment);
        assert_eq!(events[0].experiment_slug, "exp-1");
    }

    #[test]
    fn test_new_experiment_opted_out() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(false, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.status,
            EnrollmentStatus::NotEnrolled {
                reason: NotEnrolledReason::OptOut
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_new_experiment_paused() {
        let fixture = Fixture::new();
        let exp = Experiment::builder("exp-1")
            .branch(Branch::new("control", 1))
            .enrollment_paused(true)
            .build();
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.status,
            EnrollmentStatus::NotEnrolled {
                reason: NotEnrolledReason::EnrollmentsPaused
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_new_experiment_not_targeted() {
        let fixture = Fixture::new();
        let mut exp = test_experiment("exp-1");
        exp.targeting = Some("app_id == 'some.other.app'".to_string());
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.status,
            EnrollmentStatus::NotEnrolled {
                reason: NotEnrolledReason::NotTargeted
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_new_experiment_targeting_error_is_contained() {
        let fixture = Fixture::new();
        let mut exp = test_experiment("exp-1");
        exp.targeting = Some("nonsense ===".to_string());
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.status,
            EnrollmentStatus::NotEnrolled {
                reason: NotEnrolledReason::Error
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_new_experiment_missing_unit_is_ineligible() {
        let fixture = Fixture::new();
        let mut exp = test_experiment("exp-1");
        exp.bucket_config.randomization_unit = "client_id".to_string();
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.status,
            EnrollmentStatus::NotEnrolled {
                reason: NotEnrolledReason::Error
            }
        );
    }

    #[test]
    fn test_new_experiment_out_of_sample() {
        let fixture = Fixture::new();
        let mut exp = test_experiment("exp-1");
        exp.bucket_config.count = 0;
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.status,
            EnrollmentStatus::NotEnrolled {
                reason: NotEnrolledReason::NotSelected
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_new_experiment_zero_ratios_skipped_without_record() {
        let fixture = Fixture::new();
        let mut exp = test_experiment("exp-1");
        for branch in &mut exp.branches {
            branch.ratio = 0;
        }
        let mut events = vec![];
        let record = fixture
            .evolver()
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap();

        assert!(record.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn test_update_keeps_enrollment_id() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let evolver = fixture.evolver();
        let first = evolver
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();
        let second = evolver
            .evolve_enrollment(true, Some(&exp), Some(&exp), Some(&first), &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        // Only the original enrollment event.
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_update_targeting_change_disqualifies() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let evolver = fixture.evolver();
        let enrolled = evolver
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();
        let EnrollmentStatus::Enrolled { enrollment_id, .. } = &enrolled.status else {
            unreachable!()
        };
        let enrollment_id = *enrollment_id;

        let mut updated_exp = exp.clone();
        updated_exp.targeting = Some("app_id == 'some.other.app'".to_string());
        events.clear();
        let updated = evolver
            .evolve_enrollment(
                true,
                Some(&exp),
                Some(&updated_exp),
                Some(&enrolled),
                &mut events,
            )
            .unwrap()
            .unwrap();

        assert!(matches!(
            updated.status,
            EnrollmentStatus::Disqualified {
                reason: DisqualifiedReason::NotTargeted,
                enrollment_id: id,
                ..
            } if id == enrollment_id
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change, EnrollmentChangeEventType::Disqualification);
        assert_eq!(events[0].reason.as_deref(), Some("targeting"));
    }

    #[test]
    fn test_update_enrolled_branch_removed_disqualifies() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let evolver = fixture.evolver();
        let enrolled = evolver
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        let mut updated_exp = exp.clone();
        updated_exp.branches = vec![Branch::new("renamed-a", 1), Branch::new("renamed-b", 1)];
        events.clear();
        let updated = evolver
            .evolve_enrollment(
                true,
                Some(&exp),
                Some(&updated_exp),
                Some(&enrolled),
                &mut events,
            )
            .unwrap()
            .unwrap();

        assert!(matches!(
            updated.status,
            EnrollmentStatus::Disqualified {
                reason: DisqualifiedReason::Error,
                ..
            }
        ));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_update_paused_keeps_existing_enrollment() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let evolver = fixture.evolver();
        let enrolled = evolver
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        let mut paused = exp.clone();
        paused.is_enrollment_paused = true;
        events.clear();
        let updated = evolver
            .evolve_enrollment(true, Some(&exp), Some(&paused), Some(&enrolled), &mut events)
            .unwrap()
            .unwrap();

        assert_eq!(updated, enrolled);
        assert!(events.is_empty());
    }

    #[test]
    fn test_removal_emits_single_unenrollment() {
        let fixture = Fixture::new();
        let exp = test_experiment("exp-1");
        let mut events = vec![];
        let evolver = fixture.evolver();
        let enrolled = evolver
            .evolve_enrollment(true, None, Some(&exp), None, &mut events)
            .unwrap()
            .unwrap();

        events.clear();
        let (records, events) = evolver
            .evolve_enrollments(true, &[exp], &[], &[enrolled])
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change, EnrollmentChangeEventType::Unenrollment);
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0].status,
            EnrollmentStatus::WasEnrolled { .. }
        ));
    }

    #[test]
    fn test_global_opt_out_disqualifies_all_active() {
        let fixture = Fixture::new();
        let experiments = vec![test_experiment("exp-a"), test_experiment("exp-b")];
        let evolver = fixture.evolver();
        let (records, _) = evolver
            .evolve_enrollments(true, &[], &experiments, &[])
            .unwrap();

        let (after, events) = evolver
            .evolve_enrollments(false, &experiments, &experiments, &records)
            .unwrap();

        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.change == EnrollmentChangeEventType::Disqualification));
        // Ascending slug order.
        assert_eq!(events[0].experiment_slug, "exp-a");
        assert_eq!(events[1].experiment_slug, "exp-b");
        assert!(after.iter().all(|r| matches!(
            r.status,
            EnrollmentStatus::Disqualified {
                reason: DisqualifiedReason::OptOut,
                ..
            }
        )));

        // Second pass is quiescent.
        let (_, events) = evolver
            .evolve_enrollments(false, &experiments, &experiments, &after)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_one_bad_experiment_does_not_poison_the_batch() {
        let fixture = Fixture::new();
        let good = test_experiment("exp-good");
        let mut bad = test_experiment("exp-bad");
        for branch in &mut bad.branches {
            branch.ratio = 0;
        }

        let evolver = fixture.evolver();
        let (records, events) = evolver
            .evolve_enrollments(true, &[], &[bad, good], &[])
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slug, "exp-good");
        assert!(records[0].status.is_enrolled());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].experiment_slug, "exp-good");
    }
}
