//! Thread-safe client façade
//!
//! [`ExperimentClient`] is the single entry point hosts embed. Every public
//! operation is synchronous; state-mutating operations serialize through one
//! coarse mutex around store + cache, so at most one mutation is in flight
//! and readers never observe a half-applied diff. Network fetches run outside
//! that lock: a slow server never blocks getters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{AppContext, Branch, Experiment, RandomizationUnits};
use crate::enrollment::{
    EnrolledReason, EnrollmentChangeEvent, EnrollmentStatus, EnrollmentsEvolver,
    ExperimentEnrollment,
};
use crate::kv::FileKvStore;
use crate::source::{parse_experiments, CatalogSource, RemoteSettingsConfig};
use crate::store::EnrollmentStore;
use crate::targeting::{AttributeEvaluator, TargetingEvaluator};
use crate::{Error, Result};

/// Read model for one active enrollment, served from the applied snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrolledExperiment {
    /// Experiment slug.
    pub slug: String,
    /// Human-readable experiment name.
    pub user_facing_name: String,
    /// Human-readable experiment description.
    pub user_facing_description: String,
    /// Branch the device is assigned to.
    pub branch_slug: String,
    /// Audit-correlation id of the enrollment.
    pub enrollment_id: String,
}

/// In-memory copy of the applied snapshot for non-blocking getters.
struct Snapshot {
    experiments: Vec<Experiment>,
    enrollments: Vec<ExperimentEnrollment>,
    participating: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            experiments: Vec::new(),
            enrollments: Vec::new(),
            participating: true,
        }
    }
}

#[derive(Default)]
struct ClientState {
    store: Option<EnrollmentStore>,
    device_id: Option<Uuid>,
    cache: Snapshot,
}

/// The embedded experiment-enrollment client.
///
/// # Example
///
/// ```rust,no_run
/// use cohorte::{AppContext, ExperimentClient, RandomizationUnits};
///
/// # fn main() -> cohorte::Result<()> {
/// let context = AppContext {
///     app_id: "org.example.app".to_string(),
///     ..Default::default()
/// };
/// let client = ExperimentClient::new(
///     context,
///     "/var/lib/example/enrollments.db",
///     None,
///     RandomizationUnits::new(),
/// )?;
/// client.initialize()?;
///
/// let catalog = r#"[{
///     "slug": "new-tab-layout",
///     "branches": [
///         {"slug": "control", "ratio": 1},
///         {"slug": "treatment", "ratio": 1}
///     ],
///     "bucketConfig": {
///         "randomizationUnit": "device_id",
///         "namespace": "new-tab-layout",
///         "count": 10000
///     }
/// }]"#;
/// client.set_experiments_locally(catalog)?;
/// for event in client.apply_pending_experiments()? {
///     println!("{event:?}");
/// }
/// println!("{:?}", client.get_experiment_branch("new-tab-layout")?);
/// # Ok(())
/// # }
/// ```
pub struct ExperimentClient {
    app_attributes: HashMap<String, String>,
    randomization_units: RandomizationUnits,
    db_path: PathBuf,
    evaluator: Box<dyn TargetingEvaluator>,
    source: Option<Box<dyn CatalogSource>>,
    state: Mutex<ClientState>,
}

impl ExperimentClient {
    /// Create a client. The database is not opened until
    /// [`initialize`](Self::initialize).
    ///
    /// # Errors
    /// * [`Error::InvalidUrl`] when the remote settings URL does not parse
    /// * [`Error::RequestError`] when a config is given but the crate was
    ///   built without the `remote-http` feature
    pub fn new(
        app_context: AppContext,
        db_path: impl AsRef<Path>,
        remote_settings_config: Option<RemoteSettingsConfig>,
        randomization_units: RandomizationUnits,
    ) -> Result<Self> {
        let source: Option<Box<dyn CatalogSource>> = match remote_settings_config {
            #[cfg(feature = "remote-http")]
            Some(config) => Some(Box::new(crate::source::RemoteSettingsSource::new(config)?)),
            #[cfg(not(feature = "remote-http"))]
            Some(_) => {
                return Err(Error::RequestError(
                    "built without the remote-http feature".to_string(),
                ))
            }
            None => None,
        };
        Ok(Self {
            app_attributes: app_context.as_attributes(),
            randomization_units,
            db_path: db_path.as_ref().to_path_buf(),
            evaluator: Box::new(AttributeEvaluator::new()),
            source,
            state: Mutex::new(ClientState::default()),
        })
    }

    /// Replace the catalog source (e.g. with a stub in tests).
    #[must_use]
    pub fn with_catalog_source(mut self, source: Box<dyn CatalogSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the targeting evaluator with a host-supplied interpreter.
    #[must_use]
    pub fn with_targeting_evaluator(mut self, evaluator: Box<dyn TargetingEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Open the database and load the applied snapshot into the read cache.
    ///
    /// Idempotent. Absent state initializes empty; a corrupt database
    /// surfaces [`Error::InvalidPersistedData`] so the host can decide to
    /// wipe and reinitialize. On failure no partial cache is populated.
    ///
    /// # Errors
    /// * [`Error::Io`] when the database file cannot be opened
    /// * [`Error::InvalidPersistedData`] when persisted state is undecodable
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        if state.store.is_some() {
            return Ok(());
        }

        let store = EnrollmentStore::new(Box::new(FileKvStore::open(&self.db_path)?));
        let device_id = match store.read_device_id()? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                store.write_device_id(id)?;
                tracing::info!(%id, "generated device id");
                id
            }
        };
        let cache = Snapshot {
            experiments: store.read_applied_catalog()?,
            enrollments: store.read_enrollments()?,
            participating: store.read_global_participation()?,
        };

        tracing::info!(
            experiments = cache.experiments.len(),
            records = cache.enrollments.len(),
            "enrollment client initialized"
        );
        state.store = Some(store);
        state.device_id = Some(device_id);
        state.cache = cache;
        Ok(())
    }

    /// The branch the device is enrolled in, or `None` when not enrolled.
    ///
    /// # Errors
    /// [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize).
    pub fn get_experiment_branch(&self, slug: &str) -> Result<Option<String>> {
        let state = self.lock();
        Self::store(&state)?;
        Ok(state
            .cache
            .enrollments
            .iter()
            .find(|record| record.slug == slug)
            .and_then(|record| match &record.status {
                EnrollmentStatus::Enrolled { branch, .. } => Some(branch.clone()),
                _ => None,
            }))
    }

    /// All branches of an experiment in the applied catalog.
    ///
    /// # Errors
    /// * [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize)
    /// * [`Error::NoSuchExperiment`] when the slug is not in the applied catalog
    pub fn get_experiment_branches(&self, slug: &str) -> Result<Vec<Branch>> {
        let state = self.lock();
        Self::store(&state)?;
        state
            .cache
            .experiments
            .iter()
            .find(|e| e.slug == slug)
            .map(|e| e.branches.clone())
            .ok_or_else(|| Error::NoSuchExperiment(slug.to_string()))
    }

    /// All experiments the device actively participates in.
    ///
    /// # Errors
    /// [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize).
    pub fn get_active_experiments(&self) -> Result<Vec<EnrolledExperiment>> {
        let state = self.lock();
        Self::store(&state)?;
        let mut active = Vec::new();
        for record in &state.cache.enrollments {
            if let EnrollmentStatus::Enrolled {
                branch,
                enrollment_id,
                ..
            } = &record.status
            {
                if let Some(experiment) = state
                    .cache
                    .experiments
                    .iter()
                    .find(|e| e.slug == record.slug)
                {
                    active.push(EnrolledExperiment {
                        slug: experiment.slug.clone(),
                        user_facing_name: experiment.user_facing_name.clone(),
                        user_facing_description: experiment.user_facing_description.clone(),
                        branch_slug: branch.clone(),
                        enrollment_id: enrollment_id.to_string(),
                    });
                } else {
                    tracing::warn!(slug = %record.slug, "enrollment record without matching experiment");
                }
            }
        }
        Ok(active)
    }

    /// The persisted global participation flag.
    ///
    /// # Errors
    /// [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize).
    pub fn get_global_user_participation(&self) -> Result<bool> {
        let state = self.lock();
        Self::store(&state)?;
        Ok(state.cache.participating)
    }

    /// Persist the global participation flag and immediately re-evaluate the
    /// applied catalog under it.
    ///
    /// Opting out disqualifies every active enrollment (with events); doing
    /// it again is quiescent. Opting back in re-evaluates not-enrolled
    /// records; previously disqualified experiments stay disqualified.
    ///
    /// # Errors
    /// [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize),
    /// or a persistence failure, in which case nothing was committed.
    pub fn set_global_user_participation(
        &self,
        participating: bool,
    ) -> Result<Vec<EnrollmentChangeEvent>> {
        let mut state = self.lock();
        let (cache, events) = {
            let store = Self::store(&state)?;
            let device_id = Self::device_id(&state)?;
            store.write_global_participation(participating)?;
            let applied = store.read_applied_catalog()?;
            let records = store.read_enrollments()?;
            let (new_records, events) = self
                .evolver(&device_id)
                .evolve_enrollments(participating, &applied, &applied, &records)?;
            store.commit_applied(&applied, &new_records)?;
            (
                Snapshot {
                    experiments: applied,
                    enrollments: new_records,
                    participating,
                },
                events,
            )
        };
        state.cache = cache;
        Ok(events)
    }

    /// Fetch the catalog from the remote source and stage it as pending.
    ///
    /// No enrollment state changes and no events; only
    /// [`apply_pending_experiments`](Self::apply_pending_experiments)
    /// transitions state. The network round trip runs outside the mutation
    /// lock.
    ///
    /// # Errors
    /// * [`Error::RequestError`] when no catalog source is configured or the
    ///   request fails
    /// * [`Error::Backoff`] when the server asks the caller to slow down
    /// * [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize)
    pub fn fetch_experiments(&self) -> Result<()> {
        let source = self.source.as_ref().ok_or_else(|| {
            Error::RequestError("no catalog source configured".to_string())
        })?;
        let experiments = source.fetch_experiments()?;

        let state = self.lock();
        Self::store(&state)?.write_pending_catalog(&experiments)
    }

    /// Stage a caller-supplied catalog as pending, bypassing the network.
    ///
    /// Uses the identical schema as a remote fetch, so a following apply
    /// produces identical results to a fetch delivering the same bytes.
    ///
    /// # Errors
    /// * [`Error::InvalidExperimentFormat`] rejecting the whole payload
    /// * [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize)
    pub fn set_experiments_locally(&self, json: &str) -> Result<()> {
        let experiments = parse_experiments(json)?;
        let state = self.lock();
        Self::store(&state)?.write_pending_catalog(&experiments)
    }

    /// Diff the pending catalog against the applied snapshot, commit the new
    /// state atomically, and return the audit events in ascending slug order.
    ///
    /// With no pending catalog staged this is a no-op returning no events;
    /// re-applying an unchanged catalog is likewise quiescent.
    ///
    /// # Errors
    /// [`Error::DatabaseNotReady`] before [`initialize`](Self::initialize),
    /// or a persistence failure, in which case the previous applied snapshot
    /// stays in effect.
    pub fn apply_pending_experiments(&self) -> Result<Vec<EnrollmentChangeEvent>> {
        let mut state = self.lock();
        let (cache, events) = {
            let store = Self::store(&state)?;
            let device_id = Self::device_id(&state)?;
            let Some(pending) = store.read_pending_catalog()? else {
                tracing::debug!("no pending catalog, nothing to apply");
                return Ok(Vec::new());
            };
            let participating = store.read_global_participation()?;
            let applied = store.read_applied_catalog()?;
            let records = store.read_enrollments()?;
            let (new_records, events) = self
                .evolver(&device_id)
                .evolve_enrollments(participating, &applied, &pending, &records)?;
            store.commit_applied(&pending, &new_records)?;
            (
                Snapshot {
                    experiments: pending,
                    enrollments: new_records,
                    participating,
                },
                events,
            )
        };
        state.cache = cache;
        Ok(events)
    }

    /// Convenience: [`fetch_experiments`](Self::fetch_experiments) followed
    /// by [`apply_pending_experiments`](Self::apply_pending_experiments).
    ///
    /// # Errors
    /// Whatever either step returns.
    pub fn update_experiments(&self) -> Result<Vec<EnrollmentChangeEvent>> {
        self.fetch_experiments()?;
        self.apply_pending_experiments()
    }

    /// Force-enroll into a branch, bypassing targeting and bucketing.
    ///
    /// Developer verification flows only.
    ///
    /// # Errors
    /// * [`Error::NoSuchExperiment`] when the slug is not in the applied catalog
    /// * [`Error::NoSuchBranch`] when the experiment has no such branch
    pub fn opt_in_with_branch(
        &self,
        experiment_slug: &str,
        branch_slug: &str,
    ) -> Result<Vec<EnrollmentChangeEvent>> {
        let mut state = self.lock();
        let (enrollments, events) = {
            let store = Self::store(&state)?;
            let applied = store.read_applied_catalog()?;
            let experiment = applied
                .iter()
                .find(|e| e.slug == experiment_slug)
                .ok_or_else(|| Error::NoSuchExperiment(experiment_slug.to_string()))?;
            if !experiment.has_branch(branch_slug) {
                return Err(Error::NoSuchBranch(
                    branch_slug.to_string(),
                    experiment_slug.to_string(),
                ));
            }
            let record = ExperimentEnrollment::new(
                experiment_slug,
                EnrollmentStatus::new_enrolled(EnrolledReason::OptIn, branch_slug),
            );
            let events = vec![record.change_event()];
            store.write_enrollment(&record)?;
            (store.read_enrollments()?, events)
        };
        state.cache.enrollments = enrollments;
        Ok(events)
    }

    /// Force-unenroll from an experiment.
    ///
    /// Developer verification flows only.
    ///
    /// # Errors
    /// [`Error::NoSuchExperiment`] when no record exists for the slug.
    pub fn opt_out(&self, experiment_slug: &str) -> Result<Vec<EnrollmentChangeEvent>> {
        let mut state = self.lock();
        let (enrollments, events) = {
            let store = Self::store(&state)?;
            let existing = store
                .read_enrollments()?
                .into_iter()
                .find(|record| record.slug == experiment_slug)
                .ok_or_else(|| Error::NoSuchExperiment(experiment_slug.to_string()))?;
            let mut events = Vec::new();
            let updated = existing.on_explicit_opt_out(&mut events);
            store.write_enrollment(&updated)?;
            (store.read_enrollments()?, events)
        };
        state.cache.enrollments = enrollments;
        Ok(events)
    }

    fn evolver<'a>(&'a self, device_id: &'a str) -> EnrollmentsEvolver<'a> {
        EnrollmentsEvolver::new(
            device_id,
            &self.randomization_units,
            &self.app_attributes,
            self.evaluator.as_ref(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(state: &ClientState) -> Result<&EnrollmentStore> {
        state.store.as_ref().ok_or(Error::DatabaseNotReady)
    }

    fn device_id(state: &ClientState) -> Result<String> {
        state
            .device_id
            .map(|id| id.to_string())
            .ok_or(Error::DatabaseNotReady)
    }
}
