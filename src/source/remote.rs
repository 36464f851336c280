//! Remote settings catalog source over HTTP

use super::{parse_experiments, CatalogSource, RemoteSettingsConfig};
use crate::catalog::Experiment;
use crate::{Error, Result};

/// Seconds to wait when the server signals backoff without a Retry-After.
const DEFAULT_BACKOFF_SECS: u64 = 60;

/// Fetches experiment catalogs from a remote settings endpoint.
///
/// No retries live here: a [`Error::Backoff`] result is a contract with the
/// caller, who must delay its own next fetch attempt.
#[derive(Debug)]
pub struct RemoteSettingsSource {
    config: RemoteSettingsConfig,
    client: reqwest::blocking::Client,
}

impl RemoteSettingsSource {
    /// Create a source for the given endpoint configuration.
    ///
    /// # Errors
    /// * [`Error::InvalidUrl`] when the server URL does not parse
    /// * [`Error::RequestError`] when the HTTP client cannot be built
    pub fn new(config: RemoteSettingsConfig) -> Result<Self> {
        reqwest::Url::parse(&config.server_url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", config.server_url)))?;
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| Error::RequestError(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn records_url(&self) -> String {
        format!(
            "{}/v1/buckets/{}/collections/{}/records",
            self.config.server_url.trim_end_matches('/'),
            self.config.bucket_name,
            self.config.collection_name
        )
    }
}

impl CatalogSource for RemoteSettingsSource {
    fn fetch_experiments(&self) -> Result<Vec<Experiment>> {
        let url = self.records_url();
        tracing::debug!(%url, "fetching experiment catalog");

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::RequestError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BACKOFF_SECS);
            return Err(Error::Backoff(retry_after));
        }
        if !status.is_success() {
            return Err(Error::ResponseError(format!("{url} returned {status}")));
        }

        let body = response
            .text()
            .map_err(|e| Error::ResponseError(e.to_string()))?;
        let experiments = parse_experiments(&body)?;
        tracing::info!(count = experiments.len(), "fetched experiment catalog");
        Ok(experiments)
    }
}
