mod config;
mod fetcher;
mod observation;
mod telemetry;
mod writer;

use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::telemetry::Telemetry;
use crate::writer::InfluxWriter;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;

/// One complete pass: fetch from every host, then write the batch. Errors
/// stay inside the cycle; nothing here ever stops the loop.
async fn run_cycle(fetcher: &Fetcher, writer: &InfluxWriter) {
    let observations = fetcher.fetch_all().await;
    if observations.is_empty() {
        tracing::warn!("no observations fetched this cycle; skipping write");
        return;
    }
    if let Err(err) = writer.write_observations(&observations).await {
        tracing::error!(error = %err, "failed to write observations");
    }
}

/// Runs one cycle immediately, then one per tick, until `shutdown` resolves.
/// Shutdown is only observed between cycles; a cycle already in progress
/// always completes.
async fn run_loop(
    fetcher: &Fetcher,
    writer: &InfluxWriter,
    poll_interval: Duration,
    shutdown: impl Future<Output = ()>,
) {
    // The first tick resolves immediately, so one cycle runs at startup
    // before the loop settles into the poll interval. Missed ticks are not
    // queued; a slow cycle just delays the next wait.
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_cycle(fetcher, writer).await,
            _ = &mut shutdown => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let telemetry = Telemetry::init(&config).await?;

    let fetcher = Fetcher::new(config.hosts.clone())?;
    let writer = InfluxWriter::new(
        &config.influx_url,
        &config.influx_token,
        &config.influx_org,
        &config.influx_bucket,
    )?;

    tracing::info!(
        host_count = config.hosts.len(),
        poll_interval_seconds = config.poll_interval_secs,
        "indoor-monitor-sink started"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(signal = "SIGINT", "received signal, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!(signal = "SIGTERM", "received signal, shutting down");
            }
        }
    };

    run_loop(&fetcher, &writer, config.poll_interval(), shutdown).await;

    telemetry.shutdown();
    Ok(())
}
