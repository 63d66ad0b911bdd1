use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::Worker;
use crate::error::{Error, Result};
use crate::executor::{DispatchUnit, RequestExecutor, RequestOptions};
use crate::target::{TargetSpec, WeightedTargetPool};
use crate::transport::Transport;

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-runs the current executable with `args`.
    pub fn current_exe<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            program: std::env::current_exe()?,
            args: args.into_iter().map(Into::into).collect(),
        })
    }
}

/// Everything a worker process needs to build its own executor. Sent as the first line
/// on the child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub targets: Vec<TargetSpec>,
    pub request: RequestOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobRequest {
    job: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobResponse {
    job: u64,
    unit: DispatchUnit,
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Parent-side proxy for one child process. The child is killed when this is dropped.
pub struct ProcessWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_job: u64,
}

impl ProcessWorker {
    pub async fn spawn(command: &ProcessCommand, spec: &WorkerSpec) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::WorkerSpawn {
                program: command.program.display().to_string(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::WorkerProtocol("worker stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::WorkerProtocol("worker stdout is not piped".to_string()))?;

        write_line(&mut stdin, spec).await?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_job: 0,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Worker for ProcessWorker {
    async fn execute(&mut self) -> Result<DispatchUnit> {
        let job = self.next_job;
        self.next_job += 1;

        write_line(&mut self.stdin, &JobRequest { job }).await?;

        let Some(line) = self.stdout.next_line().await? else {
            return Err(Error::WorkerProtocol(format!(
                "worker process {:?} exited",
                self.pid()
            )));
        };
        let response: JobResponse = serde_json::from_str(&line)?;
        if response.job != job {
            return Err(Error::WorkerProtocol(format!(
                "expected job {job}, got {}",
                response.job
            )));
        }
        Ok(response.unit)
    }
}

/// Child side of multi-process mode: reads a [`WorkerSpec`], then answers one job per
/// line until `reader` closes. Returns the number of jobs served.
pub async fn serve_worker<R, W, T>(reader: R, mut writer: W, session: T) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Transport,
{
    let mut lines = reader.lines();
    let Some(first) = lines.next_line().await? else {
        return Err(Error::WorkerProtocol("missing worker spec".to_string()));
    };
    let spec: WorkerSpec = serde_json::from_str(&first)?;
    spec.request.validate()?;

    let targets = Arc::new(WeightedTargetPool::from_specs(&spec.targets)?);
    let mut executor = RequestExecutor::new(targets, Arc::new(spec.request), session);

    let mut served = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let JobRequest { job } = serde_json::from_str(&line)?;
        let unit = executor.execute().await;
        write_line(&mut writer, &JobResponse { job, unit }).await?;
        served += 1;
    }

    tracing::debug!(served, "job stream closed");
    Ok(served)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::target::JsonTarget;
    use surge_http::{HttpRequest, HttpResponse};
    use tokio::io::AsyncReadExt;

    struct Teapot;

    impl Transport for Teapot {
        async fn send(&mut self, _req: HttpRequest) -> surge_http::Result<HttpResponse> {
            Ok(HttpResponse::new(418, "short and stout"))
        }
    }

    fn spec() -> WorkerSpec {
        WorkerSpec {
            targets: vec![TargetSpec::new(
                JsonTarget::new("/tea", serde_json::json!({})),
                1,
            )],
            request: RequestOptions::new("http://svc"),
        }
    }

    #[tokio::test]
    async fn serves_one_response_per_job_line() {
        let mut input = serde_json::to_string(&spec()).unwrap();
        input.push('\n');
        input.push_str("{\"job\":0}\n\n{\"job\":1}\n");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let served = serve_worker(input.as_bytes(), &mut client, Teapot)
            .await
            .unwrap();
        assert_eq!(served, 2);
        drop(client);

        let mut out = String::new();
        let mut server = server;
        server.read_to_string(&mut out).await.unwrap();

        let responses: Vec<JobResponse> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].job, 1);
        assert_eq!(responses[0].unit.endpoint, "/tea");
        assert_eq!(
            responses[0].unit.error,
            Some(crate::executor::ErrorClass::Status(418))
        );
    }

    #[tokio::test]
    async fn rejects_invalid_spec() {
        let mut bad = spec();
        bad.targets.clear();
        let mut input = serde_json::to_string(&bad).unwrap();
        input.push('\n');

        let err = serve_worker(input.as_bytes(), tokio::io::sink(), Teapot)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoTargets));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let cmd = ProcessCommand::new("/definitely/not/a/surge/binary");
        let err = ProcessWorker::spawn(&cmd, &spec()).await.err().unwrap();
        assert!(matches!(err, Error::WorkerSpawn { .. }));
        assert!(!err.is_configuration());
    }
}
