//! Command implementations.

pub mod bridge;
pub mod config;
pub mod eval;
pub mod id;
