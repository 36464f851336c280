//! Persistent per-experiment enrollment records
//!
//! Altering these types changes the persisted schema; older databases will
//! surface `InvalidPersistedData` on decode.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{EnrollmentChangeEvent, EnrollmentChangeEventType};

/// How long a `WasEnrolled` record is retained for audit before garbage
/// collection removes it.
pub const PREVIOUS_ENROLLMENTS_GC_DAYS: i64 = 30;

/// Why a device is enrolled.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrolledReason {
    /// A normal enrollment as per the experiment's rules.
    Qualified,
    /// Explicit opt-in through the developer verification flow.
    OptIn,
}

/// Why a device is not enrolled.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotEnrolledReason {
    /// The user opted out of experiments before this one was ever evaluated.
    OptOut,
    /// The sampling window did not select this device.
    NotSelected,
    /// The targeting expression did not match this device.
    NotTargeted,
    /// The experiment accepts no new enrollments.
    EnrollmentsPaused,
    /// Evaluation failed (malformed expression, missing randomization unit).
    Error,
}

/// Why an active enrollment was revoked.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisqualifiedReason {
    /// Re-evaluation failed (evaluation error, enrolled branch removed).
    Error,
    /// The user opted out, globally or for this experiment.
    OptOut,
    /// The targeting no longer matches this device.
    NotTargeted,
}

impl DisqualifiedReason {
    /// Stable reason string attached to disqualification events.
    #[must_use]
    pub const fn as_event_reason(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::OptOut => "opt-out",
            Self::NotTargeted => "targeting",
        }
    }
}

/// Lifecycle state of one (device, experiment) pair.
///
/// The `enrollment_id` is generated once per continuous enrolled period and
/// survives disqualification and unenrollment for audit correlation; it is
/// only regenerated when the device enrolls fresh after its record was
/// cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentStatus {
    /// The device participates in a branch.
    Enrolled {
        /// Audit-correlation id for this enrolled period.
        enrollment_id: Uuid,
        /// How the enrollment came about.
        reason: EnrolledReason,
        /// Branch the device is assigned to.
        branch: String,
    },
    /// The device does not participate.
    NotEnrolled {
        /// Why not.
        reason: NotEnrolledReason,
    },
    /// The device participated but was removed; identity retained for audit.
    Disqualified {
        /// Audit-correlation id from the enrolled period.
        enrollment_id: Uuid,
        /// Why the enrollment was revoked.
        reason: DisqualifiedReason,
        /// Branch the device was assigned to.
        branch: String,
    },
    /// The experiment disappeared while the device had an active record.
    /// Terminal; garbage collected after [`PREVIOUS_ENROLLMENTS_GC_DAYS`].
    WasEnrolled {
        /// Audit-correlation id from the enrolled period.
        enrollment_id: Uuid,
        /// Branch the device was assigned to.
        branch: String,
        /// When the experiment vanished from the catalog.
        experiment_ended_at: DateTime<Utc>,
    },
}

impl EnrollmentStatus {
    /// A fresh enrollment with a newly generated id.
    #[must_use]
    pub fn new_enrolled(reason: EnrolledReason, branch: &str) -> Self {
        Self::Enrolled {
            enrollment_id: Uuid::new_v4(),
            reason,
            branch: branch.to_string(),
        }
    }

    /// Whether this status counts as actively enrolled.
    #[must_use]
    pub const fn is_enrolled(&self) -> bool {
        matches!(self, Self::Enrolled { .. })
    }
}

/// Persistent enrollment record for one experiment.
///
/// Every experiment in the applied catalog has a record, even when the device
/// is not enrolled; that is what makes re-evaluation across catalog updates
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentEnrollment {
    /// Experiment slug this record belongs to.
    pub slug: String,
    /// Current lifecycle state.
    pub status: EnrollmentStatus,
}

impl ExperimentEnrollment {
    /// Create a record with the given status.
    #[must_use]
    pub fn new(slug: impl Into<String>, status: EnrollmentStatus) -> Self {
        Self {
            slug: slug.into(),
            status,
        }
    }

    /// Transition after the experiment disappeared from the catalog.
    ///
    /// Active records become `WasEnrolled` and emit an unenrollment event;
    /// records that never enrolled return `None` and are simply deleted.
    #[must_use]
    pub fn on_experiment_ended(
        &self,
        out_events: &mut Vec<EnrollmentChangeEvent>,
    ) -> Option<Self> {
        let (branch, enrollment_id) = match &self.status {
            EnrollmentStatus::Enrolled {
                branch,
                enrollment_id,
                ..
            }
            | EnrollmentStatus::Disqualified {
                branch,
                enrollment_id,
                ..
            } => (branch.clone(), *enrollment_id),
            EnrollmentStatus::NotEnrolled { .. } | EnrollmentStatus::WasEnrolled { .. } => {
                return None
            }
        };
        tracing::debug!(slug = %self.slug, "experiment vanished from catalog, unenrolling");
        let updated = Self {
            slug: self.slug.clone(),
            status: EnrollmentStatus::WasEnrolled {
                enrollment_id,
                branch,
                experiment_ended_at: Utc::now(),
            },
        };
        out_events.push(updated.change_event());
        Some(updated)
    }

    /// Transition for an explicit per-experiment opt-out.
    #[must_use]
    pub fn on_explicit_opt_out(&self, out_events: &mut Vec<EnrollmentChangeEvent>) -> Self {
        match &self.status {
            EnrollmentStatus::Enrolled {
                enrollment_id,
                branch,
                ..
            } => {
                let updated = Self {
                    slug: self.slug.clone(),
                    status: EnrollmentStatus::Disqualified {
                        enrollment_id: *enrollment_id,
                        reason: DisqualifiedReason::OptOut,
                        branch: branch.clone(),
                    },
                };
                out_events.push(updated.change_event());
                updated
            }
            EnrollmentStatus::NotEnrolled { .. } => Self {
                slug: self.slug.clone(),
                status: EnrollmentStatus::NotEnrolled {
                    reason: NotEnrolledReason::OptOut,
                },
            },
            EnrollmentStatus::Disqualified { .. } | EnrollmentStatus::WasEnrolled { .. } => {
                self.clone()
            }
        }
    }

    /// Drop `WasEnrolled` records once their audit retention has lapsed.
    /// Returns `None` when the record should be removed from the database.
    #[must_use]
    pub fn maybe_garbage_collect(&self) -> Option<Self> {
        if let EnrollmentStatus::WasEnrolled {
            experiment_ended_at,
            ..
        } = self.status
        {
            if Utc::now() - experiment_ended_at < Duration::days(PREVIOUS_ENROLLMENTS_GC_DAYS) {
                return Some(self.clone());
            }
        }
        tracing::debug!(slug = %self.slug, "garbage collecting enrollment");
        None
    }

    /// The audit event describing the transition into the current status.
    ///
    /// # Panics
    /// Panics on `NotEnrolled`, which never emits events; callers only invoke
    /// this after a transition into an event-bearing state.
    #[must_use]
    pub fn change_event(&self) -> EnrollmentChangeEvent {
        match &self.status {
            EnrollmentStatus::Enrolled {
                enrollment_id,
                reason,
                branch,
            } => EnrollmentChangeEvent::new(
                &self.slug,
                *enrollment_id,
                branch,
                match reason {
                    EnrolledReason::Qualified => None,
                    EnrolledReason::OptIn => Some("opt-in"),
                },
                EnrollmentChangeEventType::Enrollment,
            ),
            EnrollmentStatus::Disqualified {
                enrollment_id,
                reason,
                branch,
            } => EnrollmentChangeEvent::new(
                &self.slug,
                *enrollment_id,
                branch,
                Some(reason.as_event_reason()),
                EnrollmentChangeEventType::Disqualification,
            ),
            EnrollmentStatus::WasEnrolled {
                enrollment_id,
                branch,
                ..
            } => EnrollmentChangeEvent::new(
                &self.slug,
                *enrollment_id,
                branch,
                Some("experiment-not-in-catalog"),
                EnrollmentChangeEventType::Unenrollment,
            ),
            EnrollmentStatus::NotEnrolled { .. } => {
                unreachable!("NotEnrolled transitions emit no events")
            }
        }
    }
}
