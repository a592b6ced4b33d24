//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration from the
//! platform-appropriate directory (or an explicit path), falls back to
//! defaults on first run, and converts the on-disk values into the runtime
//! settings the network and group layers take.

pub mod config;
