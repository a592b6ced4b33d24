//! Network infrastructure: where peers might be and whether they are alive.
//!
//! # Sub-modules
//!
//! - **`discovery`** – Expands the local interfaces into candidate
//!   `(address, port)` endpoints and finds a free publish port.  No directory
//!   server is involved.
//!
//! - **`liveness`** – Tracks heartbeats per endpoint and evicts endpoints that
//!   stay silent longer than the timeout, disconnecting them from the
//!   subscriber.

pub mod discovery;
pub mod liveness;
