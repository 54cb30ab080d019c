//! cairn-lib: an incremental rule-execution engine.
//!
//! - `store`: content-addressed blobs and directory trees, with a local on-disk layout
//! - `fs`: path globs and snapshots of the working tree or of stored trees
//! - `process`: sandboxed local execution with a fingerprint-keyed cache
//! - `rules`: rule declarations and the compiler that resolves them into a graph
//! - `engine`: the scheduler that runs rules as memoized, invalidatable nodes

pub mod config;
pub mod consts;
pub mod engine;
pub mod fs;
pub mod platform;
pub mod process;
pub mod rules;
pub mod store;
pub mod util;
