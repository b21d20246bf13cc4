//! Warden - a policy-driven security core for applications
//!
//! This crate provides:
//! - Input validation with a configurable blocklist and path/config/template checks
//! - Context-bound authenticated encryption with key derivation and rotation
//! - Fixed-window rate limiting with blocking
//! - Hash-chained, tamper-evident audit logging
//! - Secure collaborators: sealed config loading and resource detection

pub mod concurrency;
pub mod config;
pub mod paths;
pub mod secure;
pub mod security;

pub use config::Config;
pub use security::{SecurityMode, SecurityService};
