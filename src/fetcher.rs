use crate::observation::Observation;
use anyhow::Result;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

const OBSERVATION_PATH: &str = "/api/v1/observation";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status code {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode observation: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Collects one observation per configured host each cycle. The HTTP client
/// is shared across all hosts and cycles; per-host failures are logged and
/// skipped so one unreachable sensor never blocks the rest of the fleet.
pub struct Fetcher {
    hosts: Vec<String>,
    client: reqwest::Client,
    fetched: Counter<u64>,
    failures: Counter<u64>,
}

impl Fetcher {
    pub fn new(hosts: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        let meter = opentelemetry::global::meter("indoor-monitor-sink");
        Ok(Self {
            hosts,
            client,
            fetched: meter.u64_counter("sink_observations_fetched_total").init(),
            failures: meter.u64_counter("sink_fetch_failures_total").init(),
        })
    }

    pub async fn fetch_one(&self, host: &str) -> Result<Observation, FetchError> {
        let url = observation_url(host);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        // Anything other than 200 is a fetch failure, 2xx included.
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetches every host in registry order within one cycle. Returns only
    /// the successes, in the same order; never fails as a whole.
    pub async fn fetch_all(&self) -> Vec<Observation> {
        let mut observations = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            match self.fetch_one(host).await {
                Ok(observation) => {
                    tracing::info!(
                        host = %host,
                        device_id = %observation.device_id,
                        temperature_celsius = observation.temperature_celsius,
                        "fetched observation"
                    );
                    self.fetched.add(1, &[KeyValue::new("host", host.clone())]);
                    observations.push(observation);
                }
                Err(err) => {
                    tracing::error!(host = %host, error = %err, "failed to fetch observation");
                    self.failures.add(1, &[KeyValue::new("host", host.clone())]);
                }
            }
        }
        observations
    }
}

fn observation_url(host: &str) -> String {
    format!("{}{}", host.trim_end_matches('/'), OBSERVATION_PATH)
}
