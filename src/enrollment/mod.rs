//! Enrollment state machine: records, audit events, and the diff engine
//!
//! Per-experiment lifecycle:
//!
//! ```text
//! NotEnrolled ──> Enrolled ──> Disqualified ──┐
//!      ^              │                       │
//!      │              └──────> WasEnrolled <──┘   (experiment removed)
//!      └── record cleared / garbage collected
//! ```

mod events;
mod evolver;
mod record;

pub use events::{EnrollmentChangeEvent, EnrollmentChangeEventType};
pub use evolver::EnrollmentsEvolver;
pub use record::{
    DisqualifiedReason, EnrolledReason, EnrollmentStatus, ExperimentEnrollment,
    NotEnrolledReason, PREVIOUS_ENROLLMENTS_GC_DAYS,
};
