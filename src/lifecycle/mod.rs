//! Daemon lifecycle orchestration.

pub mod daemon;
pub mod handoff;
pub mod heartbeat;
pub mod shutdown;
pub mod signals;
pub mod version;
