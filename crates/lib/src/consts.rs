//! Crate-wide constants.

/// Directory (under the environment root) holding persisted build state.
pub const STATE_DIR_NAME: &str = ".minicons";

/// Default build directory name (under the environment root).
pub const BUILD_DIR_NAME: &str = "build";

/// Directory (under the state dir) holding one signature record per built node.
pub const RECORDS_DIR_NAME: &str = "records";

/// Number of hex characters of the identity hash used for record file names.
pub const RECORD_NAME_LEN: usize = 32;

/// Current on-disk version of signature records.
pub const RECORD_VERSION: u32 = 1;

pub const ENV_STATE_DIR: &str = "MINICONS_STATE_DIR";
pub const ENV_SIGNATURE_MODE: &str = "MINICONS_SIGNATURE_MODE";
pub const ENV_JOBS: &str = "MINICONS_JOBS";
pub const ENV_KEEP_GOING: &str = "MINICONS_KEEP_GOING";
