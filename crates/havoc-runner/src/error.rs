use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("validation error: {0}")]
    Domain(#[from] havoc_domain::DomainError),

    #[error("discovery error: {0}")]
    Discovery(#[from] havoc_enclave::DiscoveryError),

    #[error("sidecar error: {0}")]
    Sidecar(#[from] havoc_sidecar::SidecarError),

    #[error("injection error: {0}")]
    Inject(#[from] havoc_inject::InjectError),

    #[error("metrics error: {0}")]
    Metrics(#[from] havoc_metrics::MetricsError),

    #[error("container api error: {0}")]
    Docker(#[from] havoc_docker::DockerError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
