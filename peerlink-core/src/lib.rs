//! Shared runtime plumbing for PeerLink: configuration loading, logging
//! bootstrap and retry helpers used by the signaling and peer crates.

pub mod config;
pub mod logging;
pub mod resilience;

pub use config::Config;
