//! Process exit codes.

pub const SUCCESS: i32 = 0;
pub const SYNC_FAILED: i32 = 1; // Authentication or API failure
pub const CONFIG_ERROR: i32 = 2; // Bad arguments, config file or missing token
