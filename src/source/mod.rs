//! Catalog sources: where experiment definitions come from
//!
//! The network transport is an external collaborator consumed through the
//! narrow [`CatalogSource`] interface. Both the remote source and
//! locally supplied payloads go through [`parse_experiments`], so a local
//! payload applies identically to a fetch delivering the same bytes.

#[cfg(feature = "remote-http")]
mod remote;

#[cfg(feature = "remote-http")]
pub use remote::RemoteSettingsSource;

use serde::{Deserialize, Serialize};

use crate::catalog::Experiment;
use crate::{Error, Result};

/// Where the remote settings endpoint lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSettingsConfig {
    /// Base server URL, e.g. `https://settings.example.com`.
    pub server_url: String,
    /// Bucket holding the experiment collection.
    pub bucket_name: String,
    /// Collection of experiment records.
    pub collection_name: String,
}

/// A synchronous provider of experiment catalogs.
///
/// Implementations perform their own I/O; the client façade calls
/// [`fetch_experiments`](CatalogSource::fetch_experiments) outside its
/// mutation lock, so a slow fetch never blocks concurrent getters.
pub trait CatalogSource: Send + Sync {
    /// Retrieve the current experiment catalog.
    ///
    /// # Errors
    /// * [`Error::RequestError`] / [`Error::ResponseError`] on transport failure
    /// * [`Error::Backoff`] when the server asks the caller to slow down
    /// * [`Error::InvalidExperimentFormat`] when the payload is not a catalog
    fn fetch_experiments(&self) -> Result<Vec<Experiment>>;
}

#[derive(Deserialize)]
struct RecordsEnvelope {
    data: Vec<Experiment>,
}

/// Parse a catalog payload.
///
/// Accepts either a bare JSON array of experiments or the
/// `{"data": [...]}` envelope the remote settings endpoint returns. A payload
/// that fails to conform is rejected wholesale; no partially parsed catalog
/// is ever returned.
///
/// # Errors
/// [`Error::InvalidExperimentFormat`] describing the first schema violation.
pub fn parse_experiments(json: &str) -> Result<Vec<Experiment>> {
    let result = if json.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<Experiment>>(json)
    } else {
        serde_json::from_str::<RecordsEnvelope>(json).map(|envelope| envelope.data)
    };
    result.map_err(|e| Error::InvalidExperimentFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPERIMENT_JSON: &str = r#"{
        "slug": "secure-gold",
        "branches": [
            {"slug": "control", "ratio": 1},
            {"slug": "treatment", "ratio": 1}
        ],
        "bucketConfig": {
            "randomizationUnit": "device_id",
            "namespace": "secure-gold",
            "count": 10000
        }
    }"#;

    #[test]
    fn test_parse_bare_array() {
        let experiments = parse_experiments(&format!("[{EXPERIMENT_JSON}]")).unwrap();
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].slug, "secure-gold");
    }

    #[test]
    fn test_parse_data_envelope() {
        let experiments =
            parse_experiments(&format!(r#"{{"data": [{EXPERIMENT_JSON}]}}"#)).unwrap();
        assert_eq!(experiments.len(), 1);
    }

    #[test]
    fn test_parse_rejects_whole_payload() {
        let payload = format!(r#"[{EXPERIMENT_JSON}, {{"slug": "missing-fields"}}]"#);
        let err = parse_experiments(&payload).unwrap_err();
        assert!(matches!(err, Error::InvalidExperimentFormat(_)));
    }

    #[test]
    fn test_parse_empty_catalog() {
        assert!(parse_experiments("[]").unwrap().is_empty());
        assert!(parse_experiments(r#"{"data": []}"#).unwrap().is_empty());
    }
}
