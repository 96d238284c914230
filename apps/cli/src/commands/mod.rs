//! Command implementations for the Tessera CLI.

pub mod info;
pub mod train;
pub mod validate;
