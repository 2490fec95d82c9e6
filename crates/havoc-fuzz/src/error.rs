use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("runner error: {0}")]
    Runner(#[from] havoc_runner::RunnerError),

    #[error("domain error: {0}")]
    Domain(#[from] havoc_domain::DomainError),
}
