use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container name conflict: {0}")]
    Conflict(String),

    #[error("docker api error: {0}")]
    Api(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<bollard::errors::Error> for DockerError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => DockerError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => DockerError::Conflict(message),
            other => DockerError::Api(other.to_string()),
        }
    }
}

impl DockerError {
    /// True for errors that an idempotent teardown treats as success:
    /// the resource is already gone or already on its way out.
    pub fn is_gone(&self) -> bool {
        matches!(self, DockerError::NotFound(_) | DockerError::Conflict(_))
    }
}
