//! This crate exists to coordinate versions of `tracing` across the
//! workspace. Every crate logs through the re-export below rather than
//! depending on `tracing` directly.

pub use tracing;
