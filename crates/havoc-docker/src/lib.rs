pub mod api;
pub mod client;
pub mod error;
pub mod fake;

pub use api::{
    ContainerApi, ContainerFilter, ContainerInfo, ContainerState, CreateSpec, ExecOutput,
    ResourceLimits,
};
pub use client::DockerClient;
pub use error::DockerError;
pub use fake::FakeRuntime;
