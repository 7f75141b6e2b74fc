//! Child session supervision: tracking, spawning, and reaping.

pub mod child_monitor;
pub mod environment;
pub mod registry;
pub mod spawner;
