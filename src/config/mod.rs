//! # Configuration Module
//!
//! Centralizes the engine's tuning constants and the flag words shared by
//! the public surface. Interdependent values live next to each other and
//! are checked by compile-time assertions where a mismatch would corrupt
//! on-disk state.

pub mod constants;
pub use constants::*;
