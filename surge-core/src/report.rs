use std::collections::BTreeMap;
use std::fmt::{self, Display, Write as _};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::executor::ErrorClass;
use crate::stats::Aggregator;

const NOT_AVAILABLE: &str = "n/a";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ReportFormat {
    #[default]
    #[strum(serialize = "human-readable", serialize = "human")]
    Human,
    Json,
}

/// One line of the durable time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportRow {
    pub elapsed_secs: f64,
    pub completed: u64,
    /// `None` when nothing completed in the period.
    pub avg_resp_time_ms: Option<f64>,
}

/// Appends report rows to a CSV file, flushing after every row so a crashed run still
/// leaves a readable series behind.
pub struct SeriesWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl SeriesWriter<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(File::create(path)?)
    }
}

impl<W: Write> SeriesWriter<W> {
    pub fn new(sink: W) -> Result<Self> {
        let mut inner = csv::Writer::from_writer(sink);
        inner.write_record(["time", "completed", "avg_resp_time"])?;
        inner.flush()?;
        Ok(Self { inner })
    }

    pub fn append(&mut self, row: &ReportRow) -> Result<()> {
        let avg = row
            .avg_resp_time_ms
            .map(|v| format!("{v:.0}"))
            .unwrap_or_default();
        self.inner.write_record([
            format!("{:.3}", row.elapsed_secs),
            row.completed.to_string(),
            avg,
        ])?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.inner
            .into_inner()
            .map_err(|err| crate::Error::Io(err.into_error()))
    }
}

/// Terminal figures of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub elapsed_secs: f64,
    pub workers: usize,
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub requests_abandoned: u64,
    pub peak_in_flight: u64,
    pub rps: Option<f64>,
    pub latency_mean_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub counts_by_endpoint: BTreeMap<String, u64>,
    pub failures_by_error: BTreeMap<ErrorClass, u64>,
}

impl RunSummary {
    fn from_aggregator(elapsed: Duration, agg: &Aggregator, workers: usize) -> Self {
        let totals = agg.totals();
        let percentiles = agg.latency_percentiles();
        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            workers,
            requests_submitted: totals.requests_submitted,
            requests_completed: totals.requests_completed,
            requests_abandoned: totals.requests_abandoned,
            peak_in_flight: totals.peak_in_flight,
            rps: rate(totals.requests_completed, elapsed),
            latency_mean_ms: totals.avg_resp_time_ms(),
            latency_p50_ms: percentiles.map(|p| p.p50_ms),
            latency_p90_ms: percentiles.map(|p| p.p90_ms),
            latency_p99_ms: percentiles.map(|p| p.p99_ms),
            latency_max_ms: percentiles.map(|p| p.max_ms),
            counts_by_endpoint: totals.counts_by_endpoint.clone(),
            failures_by_error: totals.failures_by_error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonProgressLine<'a> {
    kind: &'static str,
    elapsed_secs: f64,
    completed: u64,
    submitted: u64,
    pending: u64,
    rps: Option<f64>,
    avg_resp_time_ms: Option<f64>,
    period_completed: u64,
    period_avg_resp_time_ms: Option<f64>,
    counts_by_endpoint: &'a BTreeMap<String, u64>,
    failures_by_error: &'a BTreeMap<ErrorClass, u64>,
}

#[derive(Debug, Serialize)]
struct JsonSummaryLine<'a> {
    kind: &'static str,
    #[serde(flatten)]
    summary: &'a RunSummary,
}

/// Renders progress and the final summary to the console and the time series.
///
/// Reporting reads the aggregator and never mutates it, so reporting twice without new
/// completions produces identical output.
pub struct Reporter<C: Write, S: Write> {
    format: ReportFormat,
    console: C,
    series: SeriesWriter<S>,
}

impl<C: Write, S: Write> Reporter<C, S> {
    pub fn new(format: ReportFormat, console: C, series: SeriesWriter<S>) -> Self {
        Self {
            format,
            console,
            series,
        }
    }

    pub fn report(&mut self, elapsed: Duration, agg: &Aggregator) -> Result<ReportRow> {
        let totals = agg.totals();
        let period = agg.period();
        let row = ReportRow {
            elapsed_secs: elapsed.as_secs_f64(),
            completed: period.requests_completed,
            avg_resp_time_ms: period.avg_resp_time_ms(),
        };

        match self.format {
            ReportFormat::Human => {
                writeln!(
                    self.console,
                    "[Totals] elapsed: {:.3} sec, completed: {}, submitted: {}, pending: {}, rps: {}, avg resp time: {}",
                    row.elapsed_secs,
                    group_thousands(totals.requests_completed),
                    group_thousands(totals.requests_submitted),
                    group_thousands(totals.in_flight()),
                    OrNa(rate(totals.requests_completed, elapsed), 1, ""),
                    OrNa(totals.avg_resp_time_ms(), 0, " msec"),
                )?;
                writeln!(
                    self.console,
                    "[Period] completed: {}, avg resp time: {}",
                    group_thousands(row.completed),
                    OrNa(row.avg_resp_time_ms, 0, " msec"),
                )?;
                writeln!(self.console, "Counts: {}", format_counts(&totals.counts_by_endpoint))?;
                writeln!(self.console, "Errors: {}", format_counts(&totals.failures_by_error))?;
            }
            ReportFormat::Json => {
                let line = JsonProgressLine {
                    kind: "progress",
                    elapsed_secs: row.elapsed_secs,
                    completed: totals.requests_completed,
                    submitted: totals.requests_submitted,
                    pending: totals.in_flight(),
                    rps: rate(totals.requests_completed, elapsed),
                    avg_resp_time_ms: totals.avg_resp_time_ms(),
                    period_completed: row.completed,
                    period_avg_resp_time_ms: row.avg_resp_time_ms,
                    counts_by_endpoint: &totals.counts_by_endpoint,
                    failures_by_error: &totals.failures_by_error,
                };
                serde_json::to_writer(&mut self.console, &line)?;
                writeln!(self.console)?;
            }
        }
        self.console.flush()?;

        self.series.append(&row)?;
        Ok(row)
    }

    pub fn finalize(
        &mut self,
        elapsed: Duration,
        agg: &Aggregator,
        workers: usize,
    ) -> Result<RunSummary> {
        let summary = RunSummary::from_aggregator(elapsed, agg, workers);

        match self.format {
            ReportFormat::Human => self.print_summary(&summary)?,
            ReportFormat::Json => {
                let line = JsonSummaryLine {
                    kind: "summary",
                    summary: &summary,
                };
                serde_json::to_writer(&mut self.console, &line)?;
                writeln!(self.console)?;
            }
        }
        self.console.flush()?;

        Ok(summary)
    }

    fn print_summary(&mut self, s: &RunSummary) -> Result<()> {
        let out = &mut self.console;
        writeln!(out)?;
        writeln!(out, "===== Summary =====")?;
        writeln!(
            out,
            "{} reqs in {:.3} sec, {} avg response time",
            group_thousands(s.requests_completed),
            s.elapsed_secs,
            OrNa(s.latency_mean_ms, 0, " msec"),
        )?;
        writeln!(
            out,
            "submitted: {}, abandoned: {}, peak in flight: {}, rps: {}",
            group_thousands(s.requests_submitted),
            group_thousands(s.requests_abandoned),
            group_thousands(s.peak_in_flight),
            OrNa(s.rps, 1, ""),
        )?;
        writeln!(
            out,
            "latency p50: {}, p90: {}, p99: {}, max: {}",
            OrNa(s.latency_p50_ms, 1, " msec"),
            OrNa(s.latency_p90_ms, 1, " msec"),
            OrNa(s.latency_p99_ms, 1, " msec"),
            OrNa(s.latency_max_ms, 1, " msec"),
        )?;
        writeln!(out, "{} workers used", s.workers)?;
        writeln!(out, "Counts: {}", format_counts(&s.counts_by_endpoint))?;
        writeln!(out, "Errors: {}", format_counts(&s.failures_by_error))?;
        Ok(())
    }

    pub fn into_parts(self) -> (C, SeriesWriter<S>) {
        (self.console, self.series)
    }
}

fn rate(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.0).then(|| count as f64 / secs)
}

/// An optional number with a fixed precision and unit, or `n/a`.
struct OrNa(Option<f64>, usize, &'static str);

impl Display for OrNa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v:.prec$}{}", self.2, prec = self.1),
            None => f.write_str(NOT_AVAILABLE),
        }
    }
}

pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_counts<K: Display>(map: &BTreeMap<K, u64>) -> String {
    let mut out = String::from("{");
    for (i, (k, v)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "\"{k}\": {v}");
    }
    out.push('}');
    out
}
