//! Domain model module declarations.

pub mod machine;
pub mod session;
pub mod spawn;
