//! On-disk artifacts owned by a running daemon: the exclusive lock marker
//! and the persisted state record.

pub mod lock;
pub mod state_file;
