//! Types and wire messages shared by the Lanbeam registry and nodes.

pub mod constants;
pub mod error;
pub mod format;
pub mod identity;
pub mod protocol;
pub mod types;
