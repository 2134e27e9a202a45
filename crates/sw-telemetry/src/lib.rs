//! Logging setup shared by swarmyard binaries.
//!
//! All crates log through `tracing`; this crate only decides where the
//! events go and how they are formatted.

pub mod logging;
