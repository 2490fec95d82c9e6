pub mod duration;
pub mod error;
pub mod hash;
pub mod params;
pub mod types;
pub mod validate;

pub use duration::parse_duration;
pub use error::DomainError;
pub use hash::scenario_hash;
pub use params::FaultParams;
pub use types::*;
pub use validate::validate;
