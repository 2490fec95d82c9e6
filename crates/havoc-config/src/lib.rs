mod raw;
mod loader;
pub mod error;

pub use error::ConfigError;
pub use loader::{apply_overrides, load_scenario, load_scenario_str, Overrides};
