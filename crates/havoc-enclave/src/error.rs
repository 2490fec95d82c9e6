use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no endpoint found for port '{port_name}' in enclave '{enclave}' (tried: {tried})")]
    EndpointNotFound {
        enclave: String,
        port_name: String,
        tried: String,
    },

    #[error("enclave tool failed: {0}")]
    ToolFailed(String),

    #[error("selector '{alias}' matched no containers")]
    NoMatches { alias: String },

    #[error(
        "selector '{alias}' resolved to observability container '{name}'; \
         faults on the metrics service or dashboard are forbidden"
    )]
    ObservabilitySafety { alias: String, name: String },

    #[error("container api error: {0}")]
    Docker(#[from] havoc_docker::DockerError),
}
