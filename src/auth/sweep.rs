//! Periodic deletion of session nodes past their expiry.

use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, instrument, warn};

use super::clock::Clock;
use crate::store::SessionRegistry;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Delete up to `batch_size` expired nodes. A failed row is logged and skipped.
///
/// # Errors
/// Returns an error only if listing expired nodes fails.
#[instrument(skip(sessions, clock))]
pub async fn sweep_once(
    sessions: &dyn SessionRegistry,
    clock: &dyn Clock,
    batch_size: usize,
) -> Result<SweepReport> {
    let expired = sessions.expired_before(clock.now(), batch_size).await?;
    let mut report = SweepReport::default();

    for jti in expired {
        match sessions.delete(&jti).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => debug!(jti, "expired node already gone"),
            Err(err) => {
                warn!(jti, "failed to delete expired session node: {err:#}");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

fn jittered(interval: Duration, rng: &mut StdRng) -> Duration {
    interval.mul_f64(rng.gen_range(0.9..1.1))
}

/// Run [`sweep_once`] forever, roughly every `interval`.
#[must_use]
pub fn spawn(
    sessions: Arc<dyn SessionRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        info!(
            interval_seconds = interval.as_secs(),
            batch_size, "session sweeper started"
        );
        loop {
            sleep(jittered(interval, &mut rng)).await;
            match sweep_once(sessions.as_ref(), clock.as_ref(), batch_size).await {
                Ok(report) if report.deleted > 0 || report.failed > 0 => {
                    info!(
                        deleted = report.deleted,
                        failed = report.failed,
                        "expired session nodes swept"
                    );
                }
                Ok(_) => debug!("no expired session nodes"),
                Err(err) => error!("session sweep failed: {err:#}"),
            }
        }
    })
}
