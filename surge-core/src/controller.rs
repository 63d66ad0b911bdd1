use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Instant, timeout};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::report::{Reporter, RunSummary};
use crate::stats::Aggregator;

/// Minimum in-flight allowance per worker, regardless of observed throughput.
pub const WINDOW_FLOOR_PER_WORKER: u64 = 10;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// In-flight ceiling: `max_workers * max(period_completed / max_workers, 10)`, which is
/// `max(period_completed, 10 * max_workers)`.
///
/// Grows with the completions seen in the current reporting period and never drops
/// below ten jobs per worker.
#[must_use]
pub fn admission_window(max_workers: usize, period_completed: u64) -> u64 {
    let workers = max_workers.max(1) as u64;
    period_completed.max(workers.saturating_mul(WINDOW_FLOOR_PER_WORKER))
}

/// Drives one closed-loop run: submit, wait while saturated, report on a cadence, then
/// flush whatever is still in flight.
pub struct Controller<C: Write, S: Write> {
    config: ControllerConfig,
    reporter: Reporter<C, S>,
}

impl<C: Write, S: Write> Controller<C, S> {
    pub fn new(config: ControllerConfig, reporter: Reporter<C, S>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, reporter })
    }

    pub async fn run(self, pool: WorkerPool) -> Result<RunSummary> {
        let (summary, _) = self.run_with_reporter(pool).await?;
        Ok(summary)
    }

    /// Like [`Controller::run`], also handing back the reporter so callers can inspect
    /// its sinks.
    pub async fn run_with_reporter(
        mut self,
        mut pool: WorkerPool,
    ) -> Result<(RunSummary, Reporter<C, S>)> {
        let cfg = &self.config;
        let workers = pool.size();
        let started = Instant::now();
        let deadline = started + cfg.duration;
        let mut last_report = started;
        let mut agg = Aggregator::new();

        tracing::info!(
            workers,
            max_workers = cfg.max_workers,
            duration = ?cfg.duration,
            "load started"
        );

        'submit: while started.elapsed() <= cfg.duration {
            if pool.submit().is_none() {
                tracing::warn!("no workers left, stopping submission");
                break;
            }
            agg.record_submitted();

            loop {
                if !drain_ready(&mut pool, &mut agg) {
                    tracing::warn!("all workers exited, stopping submission");
                    break 'submit;
                }

                let window = admission_window(cfg.max_workers, agg.period().requests_completed);
                if agg.in_flight() < window {
                    break;
                }
                if Instant::now() >= deadline {
                    break 'submit;
                }

                match timeout(cfg.poll_interval, pool.recv()).await {
                    Ok(Some(done)) => agg.drain(done.unit),
                    Ok(None) => {
                        tracing::warn!("all workers exited, stopping submission");
                        break 'submit;
                    }
                    Err(_) => {
                        tracing::debug!(in_flight = agg.in_flight(), window, "waiting");
                    }
                }
            }

            if last_report.elapsed() > cfg.report_interval {
                self.reporter.report(started.elapsed(), &agg)?;
                agg.reset_period();
                last_report = Instant::now();
            }
        }

        let stranded = flush(&mut pool, &mut agg, cfg.flush_timeout).await;
        if stranded > 0 {
            tracing::warn!(
                stranded,
                flush_timeout = ?cfg.flush_timeout,
                "abandoning requests that did not complete"
            );
            agg.abandon(stranded);
        }

        let elapsed = started.elapsed();
        let grace = if stranded > 0 {
            Duration::ZERO
        } else {
            SHUTDOWN_GRACE
        };
        pool.shutdown(grace).await;

        let summary = self.reporter.finalize(elapsed, &agg, workers)?;
        tracing::info!(
            completed = summary.requests_completed,
            abandoned = summary.requests_abandoned,
            elapsed = ?elapsed,
            "load finished"
        );
        Ok((summary, self.reporter))
    }
}

/// Drains every completion that is already available. Returns `false` once the pool has
/// no workers left.
fn drain_ready(pool: &mut WorkerPool, agg: &mut Aggregator) -> bool {
    loop {
        match pool.try_recv() {
            Ok(done) => agg.drain(done.unit),
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

/// Waits for the remaining in-flight jobs, giving up after `per_wait` without progress.
/// Returns how many are still outstanding.
async fn flush(pool: &mut WorkerPool, agg: &mut Aggregator, per_wait: Duration) -> u64 {
    while agg.in_flight() > 0 {
        match timeout(per_wait, pool.recv()).await {
            Ok(Some(done)) => agg.drain(done.unit),
            Ok(None) => break,
            Err(_) => break,
        }
    }
    agg.in_flight()
}
