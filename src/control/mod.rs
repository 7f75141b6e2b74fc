//! Local control surface: loopback HTTP server and its client.

pub mod client;
pub mod server;
