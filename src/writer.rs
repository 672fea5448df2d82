use crate::observation::Observation;
use anyhow::Result;
use opentelemetry::metrics::Counter;
use reqwest::header;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

const MEASUREMENT: &str = "observation";
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("influx returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Writes each cycle's batch to the InfluxDB v2 write API as line protocol,
/// one request per batch. A failed write is logged and the batch is dropped;
/// there is no retry or spooling. The client is shared across cycles and
/// released on drop at shutdown.
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: String,
    token: String,
    org: String,
    bucket: String,
    points_written: Counter<u64>,
    write_failures: Counter<u64>,
}

impl InfluxWriter {
    pub fn new(url: &str, token: &str, org: &str, bucket: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(WRITE_TIMEOUT).build()?;
        let meter = opentelemetry::global::meter("indoor-monitor-sink");
        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", url.trim_end_matches('/')),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            points_written: meter.u64_counter("sink_points_written_total").init(),
            write_failures: meter.u64_counter("sink_write_failures_total").init(),
        })
    }

    pub async fn write_observations(
        &self,
        observations: &[Observation],
    ) -> Result<(), WriteError> {
        if observations.is_empty() {
            tracing::warn!("no observations to write");
            return Ok(());
        }

        let mut body = String::new();
        for observation in observations {
            tracing::debug!(
                device_id = %observation.device_id,
                timestamp = observation.timestamp,
                "prepared influx point"
            );
            body.push_str(&encode_point(observation));
            body.push('\n');
        }

        let request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.write_failures.add(1, &[]);
                return Err(err.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.write_failures.add(1, &[]);
            let body = response.text().await.unwrap_or_default();
            return Err(WriteError::Status { status, body });
        }

        self.points_written.add(observations.len() as u64, &[]);
        tracing::info!(count = observations.len(), "wrote observations to influx");
        Ok(())
    }
}

/// One line-protocol line per observation, tagged by device and timestamped
/// with the sensor's own unix-seconds value (second precision; the ISO
/// duplicate in the payload is never consulted).
fn encode_point(observation: &Observation) -> String {
    format!(
        "{},device_id={} temperature_celsius={},humidity_percent={},pressure_hpa={},last_read_ms={}i {}",
        escape_measurement(MEASUREMENT),
        escape_tag(&observation.device_id),
        observation.temperature_celsius,
        observation.humidity_percent,
        observation.pressure_hpa,
        observation.last_read_ms,
        observation.timestamp,
    )
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{RawQuery, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    fn observation(device_id: &str) -> Observation {
        Observation {
            device_id: device_id.to_string(),
            temperature_celsius: 21.5,
            humidity_percent: 40.0,
            pressure_hpa: 1013.0,
            timestamp: 1_700_000_000,
            timestamp_iso: None,
            last_read_ms: 120,
        }
    }

    #[test]
    fn encodes_canonical_point() {
        assert_eq!(
            encode_point(&observation("d1")),
            "observation,device_id=d1 temperature_celsius=21.5,humidity_percent=40,pressure_hpa=1013,last_read_ms=120i 1700000000"
        );
    }

    #[test]
    fn escapes_tag_values() {
        let line = encode_point(&observation("living room,rack=2"));
        assert!(line.starts_with("observation,device_id=living\\ room\\,rack\\=2 "));
    }

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    async fn capture_write(
        State(captured): State<Captured>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        captured
            .requests
            .lock()
            .unwrap()
            .push((query.unwrap_or_default(), auth, body));
        StatusCode::NO_CONTENT
    }

    async fn spawn_influx(captured: Captured, status: StatusCode) -> String {
        let app = Router::new()
            .route(
                "/api/v2/write",
                post(
                    move |state: State<Captured>,
                          query: RawQuery,
                          headers: HeaderMap,
                          body: String| async move {
                        let accepted = capture_write(state, query, headers, body).await;
                        if status.is_success() {
                            accepted
                        } else {
                            status
                        }
                    },
                ),
            )
            .with_state(captured);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn empty_batch_skips_the_backend() {
        // Unroutable endpoint: any request would fail, so Ok proves no call.
        let writer = InfluxWriter::new("http://127.0.0.1:9", "t", "o", "b").unwrap();
        assert!(writer.write_observations(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn writes_batch_as_single_line_protocol_request() {
        let captured = Captured::default();
        let url = spawn_influx(captured.clone(), StatusCode::NO_CONTENT).await;
        let writer = InfluxWriter::new(&url, "test-token", "test-org", "test-bucket").unwrap();

        let batch = vec![observation("d1"), observation("d2")];
        writer.write_observations(&batch).await.unwrap();

        let requests = captured.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (query, auth, body) = &requests[0];
        assert!(query.contains("org=test-org"));
        assert!(query.contains("bucket=test-bucket"));
        assert!(query.contains("precision=s"));
        assert_eq!(auth, "Token test-token");

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "observation,device_id=d1 temperature_celsius=21.5,humidity_percent=40,pressure_hpa=1013,last_read_ms=120i 1700000000"
        );
        assert!(lines[1].starts_with("observation,device_id=d2 "));
    }

    #[tokio::test]
    async fn failed_write_surfaces_status_without_retry() {
        let captured = Captured::default();
        let url = spawn_influx(captured.clone(), StatusCode::INTERNAL_SERVER_ERROR).await;
        let writer = InfluxWriter::new(&url, "t", "o", "b").unwrap();

        let result = writer.write_observations(&[observation("d1")]).await;
        assert!(matches!(result, Err(WriteError::Status { .. })));
        assert_eq!(captured.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let writer = InfluxWriter::new(&format!("http://{addr}"), "t", "o", "b").unwrap();
        let result = writer.write_observations(&[observation("d1")]).await;
        assert!(matches!(result, Err(WriteError::Transport(_))));
    }
}
