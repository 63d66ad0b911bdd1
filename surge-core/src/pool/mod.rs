//! Bounded sets of workers fed from one job queue.
//!
//! The controller submits [`JobId`]s; whichever worker is idle picks the next one up and
//! reports a [`Completion`] on a channel the controller drains. Each worker owns its own
//! transport session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::error::Result;
use crate::executor::{DispatchUnit, RequestExecutor, RequestOptions};
use crate::target::WeightedTargetPool;
use crate::transport::Transport;

mod process;

pub use process::{ProcessCommand, ProcessWorker, WorkerSpec, serve_worker};

/// Something that can run one request when asked.
///
/// Returning `Err` means the worker itself is broken (not that the request failed); the
/// pool retires it.
pub trait Worker: Send + 'static {
    fn execute(&mut self) -> impl Future<Output = Result<DispatchUnit>> + Send;
}

impl<T: Transport> Worker for RequestExecutor<T> {
    async fn execute(&mut self) -> Result<DispatchUnit> {
        Ok(RequestExecutor::execute(self).await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

#[derive(Debug, Clone)]
pub struct Completion {
    pub job: JobId,
    pub unit: DispatchUnit,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>;

pub struct WorkerPool {
    jobs_tx: Option<mpsc::UnboundedSender<JobId>>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    tasks: JoinSet<()>,
    size: usize,
    next_job: u64,
}

impl WorkerPool {
    /// Starts one task per worker. Must be called from within a tokio runtime.
    pub fn spawn<W: Worker>(workers: Vec<W>) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<JobId>();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel::<Completion>();
        let jobs: JobQueue = Arc::new(Mutex::new(jobs_rx));

        let size = workers.len();
        let mut tasks = JoinSet::new();
        for (index, worker) in workers.into_iter().enumerate() {
            tasks.spawn(run_worker(
                index,
                worker,
                jobs.clone(),
                completions_tx.clone(),
            ));
        }

        Self {
            jobs_tx: Some(jobs_tx),
            completions_rx,
            tasks,
            size,
            next_job: 0,
        }
    }

    /// In-process workers, each with a session produced by `session`.
    pub fn threaded<T, F>(
        workers: usize,
        targets: Arc<WeightedTargetPool>,
        options: Arc<RequestOptions>,
        mut session: F,
    ) -> Self
    where
        T: Transport,
        F: FnMut() -> T,
    {
        let executors = (0..workers)
            .map(|_| RequestExecutor::new(targets.clone(), options.clone(), session()))
            .collect();
        Self::spawn(executors)
    }

    /// One child process per worker.
    pub async fn spawn_processes(
        workers: usize,
        command: &ProcessCommand,
        spec: &WorkerSpec,
    ) -> Result<Self> {
        let mut children = Vec::with_capacity(workers);
        for _ in 0..workers {
            children.push(ProcessWorker::spawn(command, spec).await?);
        }
        tracing::debug!(workers, program = %command.program.display(), "worker processes started");
        Ok(Self::spawn(children))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues one job. Returns `None` once every worker is gone.
    pub fn submit(&mut self) -> Option<JobId> {
        let job = JobId(self.next_job);
        let tx = self.jobs_tx.as_ref()?;
        tx.send(job).ok()?;
        self.next_job += 1;
        Some(job)
    }

    /// Next completion, or `None` when all workers have exited and nothing is left.
    pub async fn recv(&mut self) -> Option<Completion> {
        self.completions_rx.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Completion, mpsc::error::TryRecvError> {
        self.completions_rx.try_recv()
    }

    /// Stops handing out jobs, gives running workers `grace` to finish, then aborts them.
    pub async fn shutdown(mut self, grace: Duration) {
        drop(self.jobs_tx.take());

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::debug!(remaining = self.tasks.len(), "aborting busy workers");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

async fn run_worker<W: Worker>(
    index: usize,
    mut worker: W,
    jobs: JobQueue,
    completions: mpsc::UnboundedSender<Completion>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        match worker.execute().await {
            Ok(unit) => {
                if completions.send(Completion { job, unit }).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::error!(worker = index, job = job.0, error = %err, "worker failed, retiring it");
                break;
            }
        }
    }

    // Queue first: a closed completion channel implies a closed job queue.
    drop(jobs);
    drop(completions);
}
