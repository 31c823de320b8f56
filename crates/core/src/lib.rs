//! Core functionality for the Loomnet mesh routing daemon.
//!
//! This crate provides the ambient concerns shared across the Loomnet
//! workspace: configuration loading, structured logging and the daemon-wide
//! error type.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, HookConfig, NodeConfig, RadarConfig, TransportConfig};
pub use error::{CoreError, CoreResult};
