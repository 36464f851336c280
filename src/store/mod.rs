//! Typed persistence slots for the enrollment engine
//!
//! [`EnrollmentStore`] owns every persisted record. The engine holds only a
//! transient view during a single diff computation; getters are served from
//! the client's cache, which is reloaded from here on every mutation.
//!
//! ## Persisted layout
//!
//! | key                  | value                        |
//! |----------------------|------------------------------|
//! | `meta/user-opt-in`   | global participation flag    |
//! | `meta/device-id`     | engine-owned device UUID     |
//! | `catalog/applied`    | last-applied experiment list |
//! | `catalog/pending`    | last-fetched experiment list |
//! | `enrollment/<slug>`  | one `ExperimentEnrollment`   |

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::Experiment;
use crate::enrollment::ExperimentEnrollment;
use crate::kv::{KvStore, WriteOp};
use crate::{Error, Result};

const KEY_GLOBAL_PARTICIPATION: &str = "meta/user-opt-in";
const KEY_DEVICE_ID: &str = "meta/device-id";
const KEY_APPLIED_CATALOG: &str = "catalog/applied";
const KEY_PENDING_CATALOG: &str = "catalog/pending";
const ENROLLMENT_PREFIX: &str = "enrollment/";

/// Participation defaults to opted-in until the user says otherwise.
const DEFAULT_GLOBAL_PARTICIPATION: bool = true;

/// Transactional, typed storage for catalogs and enrollment records.
pub struct EnrollmentStore {
    kv: Box<dyn KvStore>,
}

impl EnrollmentStore {
    /// Wrap a key-value backend.
    #[must_use]
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::InvalidPersistedData(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Read the global participation flag.
    ///
    /// # Errors
    /// Fails on backend I/O or undecodable persisted data.
    pub fn read_global_participation(&self) -> Result<bool> {
        Ok(self
            .get_json(KEY_GLOBAL_PARTICIPATION)?
            .unwrap_or(DEFAULT_GLOBAL_PARTICIPATION))
    }

    /// Persist the global participation flag.
    ///
    /// # Errors
    /// Fails when the write cannot be made durable.
    pub fn write_global_participation(&self, participating: bool) -> Result<()> {
        self.kv
            .put(KEY_GLOBAL_PARTICIPATION, Self::encode(&participating)?)
    }

    /// Read the engine-owned device id, if one was generated before.
    ///
    /// # Errors
    /// Fails on backend I/O or undecodable persisted data.
    pub fn read_device_id(&self) -> Result<Option<Uuid>> {
        self.get_json(KEY_DEVICE_ID)
    }

    /// Persist the engine-owned device id.
    ///
    /// # Errors
    /// Fails when the write cannot be made durable.
    pub fn write_device_id(&self, device_id: Uuid) -> Result<()> {
        self.kv.put(KEY_DEVICE_ID, Self::encode(&device_id)?)
    }

    /// The catalog currently in effect; empty when nothing was applied yet.
    ///
    /// # Errors
    /// Fails on backend I/O or undecodable persisted data.
    pub fn read_applied_catalog(&self) -> Result<Vec<Experiment>> {
        Ok(self.get_json(KEY_APPLIED_CATALOG)?.unwrap_or_default())
    }

    /// The last-fetched catalog awaiting apply, if any.
    ///
    /// # Errors
    /// Fails on backend I/O or undecodable persisted data.
    pub fn read_pending_catalog(&self) -> Result<Option<Vec<Experiment>>> {
        self.get_json(KEY_PENDING_CATALOG)
    }

    /// Stage a fetched catalog without touching enrollment state.
    ///
    /// # Errors
    /// Fails when the write cannot be made durable.
    pub fn write_pending_catalog(&self, experiments: &[Experiment]) -> Result<()> {
        tracing::debug!(count = experiments.len(), "staged pending catalog");
        self.kv
            .put(KEY_PENDING_CATALOG, Self::encode(&experiments)?)
    }

    /// All persisted enrollment records.
    ///
    /// # Errors
    /// Fails on backend I/O or undecodable persisted data.
    pub fn read_enrollments(&self) -> Result<Vec<ExperimentEnrollment>> {
        let mut records = Vec::new();
        for key in self.kv.keys_with_prefix(ENROLLMENT_PREFIX)? {
            if let Some(record) = self.get_json::<ExperimentEnrollment>(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Overwrite a single enrollment record (developer opt-in/opt-out flows).
    ///
    /// # Errors
    /// Fails when the write cannot be made durable.
    pub fn write_enrollment(&self, record: &ExperimentEnrollment) -> Result<()> {
        self.kv.put(
            &format!("{ENROLLMENT_PREFIX}{}", record.slug),
            Self::encode(record)?,
        )
    }

    /// Atomically replace the applied catalog and the full enrollment record
    /// set. Either everything below lands or nothing does:
    /// stale records are deleted, new records written, catalog swapped.
    ///
    /// # Errors
    /// Fails when the batch cannot be made durable; the previous applied
    /// snapshot stays in effect.
    pub fn commit_applied(
        &self,
        catalog: &[Experiment],
        records: &[ExperimentEnrollment],
    ) -> Result<()> {
        let mut ops = Vec::with_capacity(records.len() + 2);

        let keep: std::collections::HashSet<String> = records
            .iter()
            .map(|r| format!("{ENROLLMENT_PREFIX}{}", r.slug))
            .collect();
        for key in self.kv.keys_with_prefix(ENROLLMENT_PREFIX)? {
            if !keep.contains(&key) {
                ops.push(WriteOp::delete(key));
            }
        }
        for record in records {
            ops.push(WriteOp::put(
                format!("{ENROLLMENT_PREFIX}{}", record.slug),
                Self::encode(record)?,
            ));
        }
        ops.push(WriteOp::put(KEY_APPLIED_CATALOG, Self::encode(&catalog)?));

        self.kv.commit(ops)?;
        tracing::info!(
            experiments = catalog.len(),
            records = records.len(),
            "committed applied catalog"
        );
        Ok(())
    }
}
