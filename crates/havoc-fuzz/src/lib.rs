pub mod error;
pub mod sample;
pub mod scenario;
pub mod session;
pub mod tiers;
pub mod trigger;

pub use error::FuzzError;
pub use sample::{SampledFault, Sampler};
pub use scenario::build_scenario;
pub use session::{FuzzConfig, FuzzSession, RoundOutcome, RoundRecord, SessionSummary};
pub use tiers::{Namespace, TargetTier, TierRegistry};
pub use trigger::{TriggerCondition, TriggerOutcome, TriggerWaiter};
