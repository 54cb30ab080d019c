//! Shared utilities.
//!
//! Content hashing plus helpers used by tests across the crate.

pub mod hash;

#[cfg(test)]
pub mod testutil;
