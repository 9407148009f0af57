//! Core types for the evalbridge remote-evaluation bridge.
//!
//! This crate defines the envelopes exchanged between runtimes, the shared
//! error taxonomy, and the configuration tree. It contains no I/O.

pub mod config;
pub mod envelope;
pub mod error;
