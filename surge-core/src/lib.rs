//! Closed-loop HTTP load generation: weighted target selection, per-worker request
//! execution, adaptive admission control and periodic reporting.

pub mod config;
pub mod controller;
pub mod executor;
pub mod pool;
pub mod report;
pub mod stats;
pub mod target;
pub mod transport;

mod error;

pub use config::{ControllerConfig, ExecutionMode, default_max_workers};
pub use controller::{Controller, admission_window};
pub use error::{Error, Result};
pub use executor::{DispatchUnit, ErrorClass, RequestExecutor, RequestOptions};
pub use pool::{Completion, JobId, ProcessCommand, Worker, WorkerPool, WorkerSpec, serve_worker};
pub use report::{ReportFormat, ReportRow, Reporter, RunSummary, SeriesWriter};
pub use stats::{Aggregator, PeriodStatistics, RunStatistics};
pub use target::{JsonTarget, Target, TargetGenerator, TargetSpec, WeightedTargetPool};
pub use transport::Transport;
