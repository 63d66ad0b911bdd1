use anyhow::Context as _;
use surge_http::HttpClient;
use tokio::io::BufReader;

/// Child side of `--mode multi-process`: the worker spec and jobs arrive on stdin, results
/// leave on stdout. Logs stay on stderr so they never corrupt the protocol.
pub async fn serve() -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let served = surge_core::serve_worker(stdin, stdout, HttpClient::default())
        .await
        .context("worker process failed")?;

    tracing::debug!(served, pid = std::process::id(), "worker exiting");
    Ok(())
}
