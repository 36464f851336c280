//! Experiment catalog data model
//!
//! The wire schema shared by the remote catalog source and locally supplied
//! payloads, plus the host-supplied device identity types.
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< Branch (N)
//!      │                 └── FeatureConfig (0..1)
//!      └── BucketConfig (1)
//! ```

mod branch;
mod context;
mod experiment;

pub use branch::{Branch, FeatureConfig};
pub use context::{AppContext, RandomizationUnits, DEVICE_ID_UNIT};
pub use experiment::{BucketConfig, Experiment, ExperimentBuilder};
