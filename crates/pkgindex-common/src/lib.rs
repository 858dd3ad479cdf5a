//! pkgindex Common - Shared types and configuration
//!
//! This crate provides the configuration tree and the small primitive
//! types (serials, project names, stage names) used by every pkgindex
//! component.

pub mod config;
pub mod types;

pub use config::Config;
pub use types::*;
