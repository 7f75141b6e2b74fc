#![forbid(unsafe_code)]

//! Background daemon that supervises local agent sessions and keeps a
//! remote authority informed about the machine.

pub mod config;
pub mod control;
pub mod daemon;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod sleep_guard;
pub mod sync;

pub use config::DaemonConfig;
pub use errors::{AppError, Result};

/// Boxed `Send` future used by the object-safe traits at the crate's seams.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
