//! Audit events for enrollment-state transitions
//!
//! Events are handed to the host as the return value of mutating operations
//! and never persisted by the engine; the store keeps records, not history.

use serde::Serialize;
use uuid::Uuid;

/// The kind of transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrollmentChangeEventType {
    /// A device entered a branch.
    Enrollment,
    /// An active enrollment was revoked; identity retained.
    Disqualification,
    /// The experiment left the catalog while the device had an active record.
    Unenrollment,
}

/// One auditable enrollment-state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentChangeEvent {
    /// Experiment the transition happened in.
    pub experiment_slug: String,
    /// Branch involved in the transition.
    pub branch_slug: String,
    /// Audit-correlation id of the enrolled period.
    pub enrollment_id: String,
    /// Stable reason string, when the transition carries one.
    pub reason: Option<String>,
    /// Transition kind.
    pub change: EnrollmentChangeEventType,
}

impl EnrollmentChangeEvent {
    pub(crate) fn new(
        slug: &str,
        enrollment_id: Uuid,
        branch: &str,
        reason: Option<&str>,
        change: EnrollmentChangeEventType,
    ) -> Self {
        Self {
            experiment_slug: slug.to_string(),
            branch_slug: branch.to_string(),
            enrollment_id: enrollment_id.to_string(),
            reason: reason.map(ToString::to_string),
            change,
        }
    }
}
