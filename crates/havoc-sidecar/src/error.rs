use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("no sidecar bound to target {0}")]
    NoSidecar(String),

    #[error("sidecar create failed for target {target}: {source}")]
    CreateFailed {
        target: String,
        #[source]
        source: havoc_docker::DockerError,
    },

    #[error("destroy failed for {count} sidecar(s): {details}")]
    DestroyAggregate { count: usize, details: String },

    #[error("container api error: {0}")]
    Docker(#[from] havoc_docker::DockerError),
}
