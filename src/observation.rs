use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One sensor reading as returned by `GET {host}/api/v1/observation`.
///
/// `timestamp` (unix seconds, supplied by the sensor) is authoritative for
/// storage ordering. `timestamp_iso` is an informational duplicate that some
/// firmware revisions omit, so decoding tolerates its absence. Field values
/// are taken as-is; a payload that decodes structurally counts as a
/// successful fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct Observation {
    pub device_id: String,
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
    pub pressure_hpa: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub timestamp_iso: Option<DateTime<Utc>>,
    pub last_read_ms: i64,
}
