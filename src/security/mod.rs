//! Centralized security module for Warden.
//!
//! See [`warden`] for the module overview, architecture diagram,
//! and public API documentation.

mod audit;
mod encryption;
mod error;
mod keyfile;
mod mode;
mod policy;
mod rate_limit;
mod redact;
mod service;
mod validation;
mod warden;

// The warden.rs facade controls the entire public API surface.
pub use self::warden::*;
