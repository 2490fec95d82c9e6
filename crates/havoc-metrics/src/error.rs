use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics service returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("unexpected response shape: {0}")]
    BadResponse(String),

    #[error("rpc error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("threshold error: {0}")]
    Threshold(#[from] havoc_domain::DomainError),
}
