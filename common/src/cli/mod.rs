//! CLI-related shared utilities.
//!
//! Centralizes CLI policy so the sender and receiver binaries don't
//! duplicate behavior.

mod color;

pub use color::ColorWhen;
