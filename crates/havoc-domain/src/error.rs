use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("scenario has no targets")]
    NoTargets,

    #[error("duplicate target alias '{0}'")]
    DuplicateAlias(String),

    #[error("fault '{phase}' references unknown target alias '{alias}'")]
    UnknownTargetAlias { phase: String, alias: String },

    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("invalid IP address '{0}'")]
    InvalidIp(String),

    #[error("parameter '{key}' must be a number, got {got}")]
    ParameterNotNumeric { key: String, got: String },

    #[error("parameter '{key}' must be a string, got {got}")]
    ParameterNotString { key: String, got: String },

    #[error("parameter '{key}' must be a boolean, got {got}")]
    ParameterNotBool { key: String, got: String },

    #[error("unparseable threshold '{0}': expected 'OP VALUE' with OP one of > < >= <= == !=")]
    BadThreshold(String),

    #[error("rpc criterion '{name}': {message}")]
    BadRpcCriterion { name: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
