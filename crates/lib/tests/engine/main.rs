//! End-to-end tests for the rule engine: compilation, scheduling, invalidation, the built-in
//! rules and processes.

mod common;
mod intrinsics_tests;
mod invalidation_tests;
mod process_cache_tests;
#[cfg(unix)]
mod process_tests;
mod property_tests;
mod scheduler_tests;
