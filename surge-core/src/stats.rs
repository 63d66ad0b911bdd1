use std::collections::BTreeMap;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::executor::{DispatchUnit, ErrorClass};

/// Cumulative figures for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub requests_submitted: u64,
    pub requests_completed: u64,
    /// Jobs still in flight when the flush gave up on them.
    pub requests_abandoned: u64,
    pub response_time_sum_ms: f64,
    pub counts_by_endpoint: BTreeMap<String, u64>,
    pub failures_by_error: BTreeMap<ErrorClass, u64>,
    pub peak_in_flight: u64,
}

impl RunStatistics {
    pub fn in_flight(&self) -> u64 {
        self.requests_submitted
            .saturating_sub(self.requests_completed)
            .saturating_sub(self.requests_abandoned)
    }

    pub fn avg_resp_time_ms(&self) -> Option<f64> {
        mean(self.response_time_sum_ms, self.requests_completed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures_by_error.values().sum()
    }
}

/// Figures accumulated since the last report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodStatistics {
    pub requests_completed: u64,
    pub response_time_sum_ms: f64,
}

impl PeriodStatistics {
    pub fn avg_resp_time_ms(&self) -> Option<f64> {
        mean(self.response_time_sum_ms, self.requests_completed)
    }
}

fn mean(sum: f64, count: u64) -> Option<f64> {
    (count > 0).then(|| sum / count as f64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// The only place run statistics are mutated. Owned by the controller task.
#[derive(Debug)]
pub struct Aggregator {
    totals: RunStatistics,
    period: PeriodStatistics,
    latency_us: Histogram<u64>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        // 1us .. 1h
        let latency_us = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)
            .unwrap_or_else(|err| panic!("failed to init histogram: {err}"));
        Self {
            totals: RunStatistics::default(),
            period: PeriodStatistics::default(),
            latency_us,
        }
    }

    pub fn totals(&self) -> &RunStatistics {
        &self.totals
    }

    pub fn period(&self) -> &PeriodStatistics {
        &self.period
    }

    pub fn in_flight(&self) -> u64 {
        self.totals.in_flight()
    }

    /// Counts a newly submitted job and returns the in-flight count including it.
    pub fn record_submitted(&mut self) -> u64 {
        self.totals.requests_submitted += 1;
        let in_flight = self.totals.in_flight();
        self.totals.peak_in_flight = self.totals.peak_in_flight.max(in_flight);
        in_flight
    }

    /// Folds one finished request into the cumulative and period figures.
    pub fn drain(&mut self, unit: DispatchUnit) {
        let latency_ms = if unit.latency_ms.is_finite() {
            unit.latency_ms.max(0.0)
        } else {
            0.0
        };

        *self
            .totals
            .counts_by_endpoint
            .entry(unit.endpoint)
            .or_default() += 1;
        if let Some(error) = unit.error {
            *self.totals.failures_by_error.entry(error).or_default() += 1;
        }

        self.totals.requests_completed += 1;
        self.totals.response_time_sum_ms += latency_ms;
        self.period.requests_completed += 1;
        self.period.response_time_sum_ms += latency_ms;

        let us = (latency_ms * 1000.0).round() as u64;
        self.latency_us.saturating_record(us.max(1));
    }

    /// Marks `n` in-flight jobs as never going to complete.
    pub fn abandon(&mut self, n: u64) {
        let n = n.min(self.totals.in_flight());
        self.totals.requests_abandoned += n;
    }

    /// Closes the current period and returns it.
    pub fn reset_period(&mut self) -> PeriodStatistics {
        std::mem::take(&mut self.period)
    }

    pub fn latency_percentiles(&self) -> Option<LatencyPercentiles> {
        let h = &self.latency_us;
        if h.is_empty() {
            return None;
        }
        Some(LatencyPercentiles {
            p50_ms: h.value_at_quantile(0.50) as f64 / 1000.0,
            p90_ms: h.value_at_quantile(0.90) as f64 / 1000.0,
            p99_ms: h.value_at_quantile(0.99) as f64 / 1000.0,
            max_ms: h.max() as f64 / 1000.0,
        })
    }
}
