#![deny(unsafe_code)]

//! Shared test utilities for the torwatch workspace.
//!
//! Provides a simulated tor control server, writers for the artifact
//! files a real daemon would drop into the watch directory, and
//! tracing helpers, so that individual crate tests stay concise.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! torwatch-test-utils = { workspace = true }
//! ```

pub mod artifacts;
pub mod sim_tor;
pub mod tracing_setup;
