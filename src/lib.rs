//! # Cohorte: Embedded Experiment-Enrollment Engine
//!
//! Cohorte decides, locally and deterministically, which branch of which
//! server-defined experiment a device participates in, persists that decision
//! durably, and reports every enrollment-state transition as an auditable
//! event. It behaves identically across process restarts and app updates.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: deterministic bucketing - identical inputs always produce
//!   identical branch assignments, across processes and architectures
//! - **Poka-Yoke safety**: two-phase fetch/apply with atomic commits - a
//!   crash leaves either the old or the new snapshot, never a mix
//! - **Genchi Genbutsu**: every mutation re-reads persisted state, no stale
//!   in-memory views survive across calls
//! - **Muda elimination**: one bad experiment never poisons the batch
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cohorte::{AppContext, ExperimentClient, RandomizationUnits};
//!
//! let context = AppContext {
//!     app_id: "org.example.app".to_string(),
//!     ..Default::default()
//! };
//! let client = ExperimentClient::new(
//!     context,
//!     "/var/lib/example/enrollments.db",
//!     None,
//!     RandomizationUnits::new().with_unit("client_id", "c-123"),
//! )?;
//! client.initialize()?;
//!
//! // Two-phase: fetch stages a pending catalog, apply transitions state.
//! for event in client.update_experiments()? {
//!     println!("enrollment change: {event:?}");
//! }
//! # Ok::<(), cohorte::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bucketing;
pub mod catalog;
pub mod client;
pub mod enrollment;
pub mod error;
pub mod kv;
pub mod source;
pub mod store;
pub mod targeting;

pub use catalog::{AppContext, Branch, BucketConfig, Experiment, FeatureConfig, RandomizationUnits};
pub use client::{EnrolledExperiment, ExperimentClient};
pub use enrollment::{EnrollmentChangeEvent, EnrollmentChangeEventType};
pub use error::{Error, Result};
pub use source::{CatalogSource, RemoteSettingsConfig};
