//! Live-migration driver
//!
//! Runs inside a one-shot job co-located with the source VM pod. Connects
//! to the monitor socket, issues `migrate`, then polls `query-migrate` on a
//! one second cadence until the transfer completes or fails, logging
//! progress along the way.

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::client::QmpClient;
use crate::error::QmpError;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Migrate the guest behind `sock_path` to `target_uri`
/// (e.g. `tcp:10.42.1.9:44123`). Returns once the migration reaches a
/// terminal state.
pub async fn run(sock_path: &str, target_uri: &str) -> Result<(), QmpError> {
    let mut client = QmpClient::connect(sock_path).await?;

    info!(%target_uri, "starting live migration");
    client.migrate(target_uri).await?;

    let started = Instant::now();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        // The monitor emits a STOP event when the guest pauses for the
        // final memory pass; consume anything pending before polling.
        client.drain_events().await?;

        let status = client.query_migrate().await?;
        let elapsed = started.elapsed();

        match status.status.as_str() {
            "completed" => {
                info!(elapsed = ?elapsed, "migration completed");
                return Ok(());
            }
            "failed" => {
                return Err(QmpError::MigrationFailed(format!(
                    "after {:.1}s",
                    elapsed.as_secs_f64()
                )));
            }
            "active" => {
                if let Some(ram) = &status.ram {
                    let remaining = estimate_remaining(elapsed, ram.transferred, ram.total);
                    info!(
                        transferred = ram.transferred,
                        total = ram.total,
                        mbps = ram.mbps,
                        remaining = ?remaining,
                        "migration active"
                    );
                } else {
                    warn!("query-migrate reported active without ram statistics");
                }
            }
            other => {
                // setup, cancelling, and friends: keep polling
                info!(status = other, "migration in transient state");
            }
        }
    }
}

/// Instantaneous remaining-time estimate from bytes moved so far. `None`
/// until any data has been transferred.
fn estimate_remaining(elapsed: Duration, transferred: u64, total: u64) -> Option<Duration> {
    if transferred == 0 {
        return None;
    }
    let projected = elapsed.as_secs_f64() * total as f64 / transferred as f64;
    Some(Duration::from_secs_f64(
        (projected - elapsed.as_secs_f64()).max(0.0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_estimate_before_any_transfer() {
        assert_eq!(estimate_remaining(Duration::from_secs(5), 0, 1000), None);
    }

    #[test]
    fn estimate_scales_with_remaining_bytes() {
        // Half the memory moved in 10s leaves roughly 10s to go.
        let remaining =
            estimate_remaining(Duration::from_secs(10), 500, 1000).unwrap();
        assert!((remaining.as_secs_f64() - 10.0).abs() < 0.01);
    }

    #[test]
    fn estimate_never_goes_negative() {
        // transferred > total can happen with dirty page rewrites
        let remaining =
            estimate_remaining(Duration::from_secs(10), 2000, 1000).unwrap();
        assert_eq!(remaining, Duration::ZERO);
    }
}
