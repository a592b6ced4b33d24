//! Infrastructure layer for the peer application.
//!
//! Contains OS-facing adapters: TCP publish/subscribe, endpoint discovery and
//! liveness, the UDP group overlay, and file-system configuration.
//!
//! **Dependency rule**: this layer may depend on `wayl_core`, but MUST NOT
//! import the `application` layer.

pub mod group;
pub mod network;
pub mod storage;
pub mod transport;
