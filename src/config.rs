use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub local: bool,
    pub tracing_enabled: bool,
    pub tracing_sample_rate: f64,
    pub tracing_service: String,
    pub tracing_version: String,
    pub otlp_endpoint: Option<String>,
    pub hosts: Vec<String>,
    pub poll_interval_secs: u64,
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "error".to_string());

        let metrics_enabled = env::var("METRICS_ENABLED")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);
        let metrics_port = env::var("METRICS_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8081);
        let local = env::var("LOCAL").map(|v| parse_bool(&v)).unwrap_or(false);

        let tracing_enabled = env::var("TRACING_ENABLED")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);
        let tracing_sample_rate = env::var("TRACING_SAMPLERATE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.01);
        let tracing_service = env::var("TRACING_SERVICE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "indoor-monitor-sink".to_string());
        let tracing_version = env::var("TRACING_VERSION").unwrap_or_default();
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let hosts = hosts_from(&env::var("HOSTS").unwrap_or_default())?;

        // A zero interval would panic the timer; fall back to the default.
        let poll_interval_secs = env::var("POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60);

        let influx_url = require_var("INFLUX_URL")?;
        let influx_token = require_var("INFLUX_TOKEN")?;
        let influx_org = require_var("INFLUX_ORG")?;
        let influx_bucket = require_var("INFLUX_BUCKET")?;

        Ok(Self {
            log_level,
            metrics_enabled,
            metrics_port,
            local,
            tracing_enabled,
            tracing_sample_rate,
            tracing_service,
            tracing_version,
            otlp_endpoint,
            hosts,
            poll_interval_secs,
            influx_url,
            influx_token,
            influx_org,
            influx_bucket,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn require_var(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{key} is required"))
}

fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn hosts_from(raw: &str) -> Result<Vec<String>> {
    let hosts = parse_hosts(raw);
    if hosts.is_empty() {
        anyhow::bail!(
            "no hosts configured, set HOSTS to a comma-separated list of sensor base URLs"
        );
    }
    Ok(hosts)
}

fn parse_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.trim_end_matches('/').to_string())
        .collect()
}
