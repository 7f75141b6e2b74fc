//! Remote sync: machine registration, the reconnecting update channel,
//! optimistic field updates and the encrypted RPC surface.

pub mod api;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod crypto;
pub mod protocol;
pub mod rpc;
