use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("parameter error: {0}")]
    Parameter(#[from] havoc_domain::DomainError),

    #[error("command failed on {target}: `{command}` exited {exit_code}: {output}")]
    CommandFailed {
        target: String,
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("timed out waiting for {target} to reach state '{state}'")]
    StateTimeout { target: String, state: String },

    #[error("sidecar error: {0}")]
    Sidecar(#[from] havoc_sidecar::SidecarError),

    #[error("container api error: {0}")]
    Docker(#[from] havoc_docker::DockerError),

    #[error("injection cancelled")]
    Cancelled,
}
