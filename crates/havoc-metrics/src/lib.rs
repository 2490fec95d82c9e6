pub mod client;
pub mod error;
pub mod eval;
pub mod rpc;

pub use client::{MetricsClient, RangeSeries, Sample};
pub use error::MetricsError;
pub use eval::{CriterionResult, Evaluator};
pub use rpc::RpcClient;
