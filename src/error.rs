//! Error types for cohorte
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Cohorte error types
///
/// One variant per failure class. Pure-component failures (bucketing,
/// targeting) are contained by the enrollment engine and converted into
/// per-experiment outcomes; they only escape through this enum when a caller
/// invokes the component directly.
#[derive(Error, Debug)]
pub enum Error {
    /// Persisted bytes could not be decoded into the expected schema
    #[error("Invalid persisted data: {0}\nThe database may be from an incompatible version. Consider wiping and reinitializing.")]
    InvalidPersistedData(String),

    /// Database used before `initialize()` completed
    #[error("Database not ready: call initialize() before any other operation")]
    DatabaseNotReady,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catalog payload does not conform to the experiment schema
    #[error("Invalid experiment format: {0}\nThe whole payload was rejected; the previously applied catalog is untouched.")]
    InvalidExperimentFormat(String),

    /// Targeting expression failed to parse
    #[error("Invalid targeting expression: {0}")]
    InvalidExpression(String),

    /// Targeting expression parsed but failed to evaluate
    #[error("Targeting evaluation failed: {0}")]
    EvaluationError(String),

    /// Branch ratios sum to zero (degenerate experiment configuration)
    #[error("Empty ratios: branch ratios for experiment '{0}' sum to zero")]
    EmptyRatios(String),

    /// Computed bucket fraction could not be mapped onto the branch space
    #[error("Bucket fraction out of bounds for experiment '{0}'")]
    OutOfBounds(String),

    /// The randomization unit an experiment requires is not available
    #[error("Missing randomization unit '{0}' required by experiment '{1}'")]
    MissingRandomizationUnit(String, String),

    /// Remote settings URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Remote catalog request failed before a response arrived
    #[error("Request error: {0}")]
    RequestError(String),

    /// Remote catalog response was unusable
    #[error("Response error: {0}")]
    ResponseError(String),

    /// The server asked us to back off; the caller must delay its next fetch
    #[error("Server requested backoff: retry after {0} seconds")]
    Backoff(u64),

    /// Enrollment identifier could not be parsed
    #[error("Invalid enrollment identifier: {0}")]
    Uuid(#[from] uuid::Error),

    /// Slug lookup failed: no such experiment
    #[error("No such experiment: '{0}'")]
    NoSuchExperiment(String),

    /// Slug lookup failed: no such branch in the experiment
    #[error("No such branch: '{0}' in experiment '{1}'")]
    NoSuchBranch(String, String),

    /// Invariant violation (defensive catch-all)
    #[error("Internal error: {0}\nPlease report this issue.")]
    Internal(&'static str),
}
