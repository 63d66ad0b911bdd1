pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one target with a positive weight is required")]
    NoTargets,

    #[error("target `{0}` must have a positive weight")]
    InvalidWeight(String),

    #[error("total target weight {0} exceeds the supported maximum of {max}", max = crate::target::MAX_TOTAL_WEIGHT)]
    TotalWeightTooLarge(u64),

    #[error("invalid execution mode `{0}` (expected `threaded` or `multi-process`)")]
    InvalidExecutionMode(String),

    #[error("`workers` must be a positive integer")]
    InvalidWorkers,

    #[error("invalid base url `{0}` (expected http:// or https://)")]
    InvalidBaseUrl(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("results file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to spawn worker process `{program}`: {source}")]
    WorkerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker protocol error: {0}")]
    WorkerProtocol(String),
}

impl Error {
    /// Configuration errors are detected before any load is generated.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoTargets
                | Self::InvalidWeight(_)
                | Self::TotalWeightTooLarge(_)
                | Self::InvalidExecutionMode(_)
                | Self::InvalidWorkers
                | Self::InvalidBaseUrl(_)
                | Self::InvalidDuration(_)
        )
    }
}
