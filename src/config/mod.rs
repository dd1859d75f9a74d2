//! Uplink Configuration Module
//!
//! Provides per-node configuration loaded from TOML files.
//!
//! ## Loading Order
//!
//! 1. `FIELDNODE_CONFIG` environment variable (path to TOML file)
//! 2. `uplink_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded [`UplinkConfig`] is passed by value into the components that
//! need it; there is no process-wide config global.

mod uplink_config;
pub mod defaults;

pub use uplink_config::*;
