pub mod cleanup;
pub mod error;
pub mod manager;
pub mod verify;

pub use cleanup::CleanupCoordinator;
pub use error::SidecarError;
pub use manager::{SidecarManager, SIDECAR_NAME_PREFIX};
pub use verify::{Verification, Verifier};
