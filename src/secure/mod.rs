//! Secure collaborators: non-secure components wrapped with validation,
//! field-level encryption, rate limiting, integrity tags and audit.

mod config_loader;
mod resources;
mod sealed;

pub use config_loader::{CONFIG_RATE_CATEGORY, ConfigSource, FileConfigSource, SecureConfigLoader};
pub use resources::{
    AllocationDecision, RESOURCE_RATE_CATEGORY, ResourceDetector, ResourceReport,
    SecureResourceDetector, SystemResourceDetector, SystemResources,
};
pub use sealed::{ConfigFormat, SealedDocument, placeholder};
