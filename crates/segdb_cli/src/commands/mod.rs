//! CLI command implementations.

pub mod compact;
pub mod get;
pub mod inspect;
pub mod verify;
