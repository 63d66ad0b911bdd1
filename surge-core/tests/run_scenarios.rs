use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use surge_core::{
    Controller, ControllerConfig, DispatchUnit, ErrorClass, JsonTarget, ReportFormat,
    RequestOptions, Reporter, RunSummary, SeriesWriter, Target, Transport, WeightedTargetPool,
    Worker, WorkerPool,
};
use surge_http::{HttpRequest, HttpResponse};

#[derive(Clone)]
enum Stub {
    Status { code: u16, delay: Duration },
    Timeout,
    Hang,
}

impl Transport for Stub {
    async fn send(&mut self, req: HttpRequest) -> surge_http::Result<HttpResponse> {
        match self {
            Self::Status { code, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(HttpResponse::new(*code, format!("{{\"url\":\"{}\"}}", req.url)))
            }
            Self::Timeout => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Err(surge_http::Error::Timeout(Duration::from_millis(1)))
            }
            Self::Hang => std::future::pending().await,
        }
    }
}

fn targets(weights: &[(&str, u32)]) -> anyhow::Result<Arc<WeightedTargetPool>> {
    let pool = WeightedTargetPool::build(
        weights
            .iter()
            .map(|(path, w)| {
                (
                    Arc::new(JsonTarget::new(*path, serde_json::json!({"n": 1}))) as Target,
                    *w,
                )
            })
            .collect(),
    )?;
    Ok(Arc::new(pool))
}

fn config(duration: Duration, max_workers: usize) -> ControllerConfig {
    ControllerConfig {
        duration,
        max_workers,
        flush_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    }
}

async fn run(
    cfg: ControllerConfig,
    pool: WorkerPool,
) -> anyhow::Result<(RunSummary, String, String)> {
    let reporter = Reporter::new(
        ReportFormat::Human,
        Vec::new(),
        SeriesWriter::new(Vec::new())?,
    );
    let (summary, reporter) = Controller::new(cfg, reporter)?
        .run_with_reporter(pool)
        .await?;
    let (console, series) = reporter.into_parts();
    Ok((
        summary,
        String::from_utf8(console)?,
        String::from_utf8(series.into_inner()?)?,
    ))
}

fn stub_pool(workers: usize, weights: &[(&str, u32)], stub: Stub) -> anyhow::Result<WorkerPool> {
    Ok(WorkerPool::threaded(
        workers,
        targets(weights)?,
        Arc::new(RequestOptions::new("http://stub")),
        move || stub.clone(),
    ))
}

fn assert_totals_consistent(s: &RunSummary) -> anyhow::Result<()> {
    let by_endpoint: u64 = s.counts_by_endpoint.values().sum();
    anyhow::ensure!(
        by_endpoint == s.requests_completed,
        "endpoint counts {by_endpoint} != completed {}",
        s.requests_completed
    );
    anyhow::ensure!(
        s.requests_submitted == s.requests_completed + s.requests_abandoned,
        "submitted {} != completed {} + abandoned {}",
        s.requests_submitted,
        s.requests_completed,
        s.requests_abandoned
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_duration_flushes_and_summarizes_once() -> anyhow::Result<()> {
    let pool = stub_pool(
        3,
        &[("/a", 1)],
        Stub::Status {
            code: 200,
            delay: Duration::from_millis(1),
        },
    )?;
    let (summary, console, series) = run(config(Duration::ZERO, 3), pool).await?;

    anyhow::ensure!(summary.requests_submitted <= 30, "{summary:?}");
    anyhow::ensure!(summary.requests_abandoned == 0);
    assert_totals_consistent(&summary)?;
    anyhow::ensure!(console.matches("===== Summary =====").count() == 1, "{console}");
    anyhow::ensure!(series.starts_with("time,completed,avg_resp_time\n"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn weighted_targets_keep_their_ratio() -> anyhow::Result<()> {
    let pool = stub_pool(
        4,
        &[("/a", 3), ("/b", 1)],
        Stub::Status {
            code: 200,
            delay: Duration::from_millis(1),
        },
    )?;
    let (summary, _, _) = run(config(Duration::from_secs(2), 4), pool).await?;

    assert_totals_consistent(&summary)?;
    anyhow::ensure!(summary.failures_by_error.is_empty(), "{summary:?}");

    let a = summary.counts_by_endpoint.get("/a").copied().unwrap_or_default() as f64;
    let b = summary.counts_by_endpoint.get("/b").copied().unwrap_or_default() as f64;
    anyhow::ensure!(a + b > 1_000.0, "too few samples: {a} + {b}");
    let ratio = a / b;
    anyhow::ensure!((2.5..3.5).contains(&ratio), "ratio {ratio}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_are_bucketed_by_status() -> anyhow::Result<()> {
    let pool = stub_pool(
        2,
        &[("/a", 1)],
        Stub::Status {
            code: 500,
            delay: Duration::from_millis(1),
        },
    )?;
    let (summary, console, _) = run(config(Duration::from_millis(300), 2), pool).await?;

    assert_totals_consistent(&summary)?;
    anyhow::ensure!(summary.requests_completed > 0);
    anyhow::ensure!(summary.failures_by_error.len() == 1);
    anyhow::ensure!(
        summary.failures_by_error.get(&ErrorClass::Status(500)) == Some(&summary.requests_completed)
    );
    anyhow::ensure!(console.contains("\"500\": "), "{console}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_timeouts_are_classified_and_timed() -> anyhow::Result<()> {
    let pool = stub_pool(2, &[("/a", 1)], Stub::Timeout)?;
    let (summary, _, _) = run(config(Duration::from_millis(300), 2), pool).await?;

    assert_totals_consistent(&summary)?;
    anyhow::ensure!(summary.requests_completed > 0);
    let timeouts = summary
        .failures_by_error
        .get(&ErrorClass::Fault("timeout".to_string()))
        .copied();
    anyhow::ensure!(timeouts == Some(summary.requests_completed), "{summary:?}");
    let mean = summary.latency_mean_ms.context("latency recorded")?;
    anyhow::ensure!(mean >= 0.0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_workers_fill_the_window_and_are_abandoned() -> anyhow::Result<()> {
    let pool = stub_pool(2, &[("/a", 1)], Stub::Hang)?;
    let cfg = ControllerConfig {
        flush_timeout: Duration::from_millis(50),
        ..config(Duration::from_millis(300), 2)
    };

    let started = std::time::Instant::now();
    let (summary, console, _) = run(cfg, pool).await?;
    anyhow::ensure!(started.elapsed() < Duration::from_secs(5));

    anyhow::ensure!(summary.peak_in_flight == 20, "{summary:?}");
    anyhow::ensure!(summary.requests_submitted == 20);
    anyhow::ensure!(summary.requests_completed == 0);
    anyhow::ensure!(summary.requests_abandoned == 20);
    anyhow::ensure!(summary.latency_mean_ms.is_none());
    anyhow::ensure!(console.contains("avg response time: n/a") || console.contains("n/a avg response time"));
    Ok(())
}

struct Broken;

impl Worker for Broken {
    async fn execute(&mut self) -> surge_core::Result<DispatchUnit> {
        Err(surge_core::Error::WorkerProtocol("worker crashed".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_pool_does_not_wedge_the_run() -> anyhow::Result<()> {
    let pool = WorkerPool::spawn(vec![Broken, Broken]);
    let started = std::time::Instant::now();
    let (summary, _, _) = run(config(Duration::from_secs(30), 2), pool).await?;

    anyhow::ensure!(started.elapsed() < Duration::from_secs(5));
    anyhow::ensure!(summary.requests_completed == 0);
    assert_totals_consistent(&summary)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_reports_land_in_the_series() -> anyhow::Result<()> {
    let pool = stub_pool(
        2,
        &[("/a", 1)],
        Stub::Status {
            code: 200,
            delay: Duration::from_millis(2),
        },
    )?;
    let cfg = ControllerConfig {
        report_interval: Duration::from_millis(100),
        ..config(Duration::from_millis(550), 2)
    };

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("results.csv");
    let reporter = Reporter::new(ReportFormat::Json, Vec::new(), SeriesWriter::create(&path)?);
    let summary = Controller::new(cfg, reporter)?.run(pool).await?;
    assert_totals_consistent(&summary)?;

    let text = std::fs::read_to_string(&path)?;
    let mut lines = text.lines();
    anyhow::ensure!(lines.next() == Some("time,completed,avg_resp_time"));
    let rows: Vec<&str> = lines.collect();
    anyhow::ensure!(rows.len() >= 3, "rows: {rows:?}");

    let mut reported = 0;
    for row in &rows {
        let cols: Vec<&str> = row.split(',').collect();
        anyhow::ensure!(cols.len() == 3, "row {row}");
        let (_, decimals) = cols[0].split_once('.').context("time has decimals")?;
        anyhow::ensure!(decimals.len() == 3, "row {row}");
        reported += cols[1].parse::<u64>()?;
    }
    anyhow::ensure!(reported <= summary.requests_completed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_grows_with_throughput_and_bounds_in_flight() -> anyhow::Result<()> {
    let pool = stub_pool(
        2,
        &[("/a", 1)],
        Stub::Status {
            code: 200,
            delay: Duration::from_millis(1),
        },
    )?;
    let cfg = ControllerConfig {
        report_interval: Duration::from_millis(100),
        ..config(Duration::from_millis(600), 2)
    };
    let (summary, _, series) = run(cfg, pool).await?;
    assert_totals_consistent(&summary)?;

    let mut reported = 0;
    let mut busiest_period = 0;
    for row in series.lines().skip(1) {
        let completed: u64 = row.split(',').nth(1).context("completed column")?.parse()?;
        reported += completed;
        busiest_period = busiest_period.max(completed);
    }
    // Completions after the last report, flush included, form the final period.
    let last_period = summary.requests_completed.saturating_sub(reported);
    let widest_window = busiest_period.max(last_period).max(2 * 10);

    anyhow::ensure!(
        summary.peak_in_flight > 20,
        "window never grew past the floor: {summary:?}"
    );
    anyhow::ensure!(
        summary.peak_in_flight <= widest_window + 1,
        "peak {} exceeds window {widest_window}",
        summary.peak_in_flight
    );
    Ok(())
}
