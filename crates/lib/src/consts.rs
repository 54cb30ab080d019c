//! Crate-wide constants.

pub const APP_NAME: &str = "cairn";

/// Salt mixed into every process cache key. Bump to orphan all cached results.
pub const PROCESS_CACHE_KEY_VERSION: u32 = 1;

/// Script written into preserved sandboxes to replay the process.
pub const RUN_SCRIPT_NAME: &str = "__run.sh";

pub const STORE_DIR_ENV: &str = "CAIRN_STORE_DIR";
pub const EXECUTION_ROOT_ENV: &str = "CAIRN_EXECUTION_ROOT";
pub const PROCESS_PARALLELISM_ENV: &str = "CAIRN_PROCESS_PARALLELISM";
pub const RULE_THREADS_ENV: &str = "CAIRN_RULE_THREADS";
pub const KEEP_SANDBOXES_ENV: &str = "CAIRN_KEEP_SANDBOXES";
pub const IN_MEMORY_STORE_ENV: &str = "CAIRN_IN_MEMORY_STORE";
