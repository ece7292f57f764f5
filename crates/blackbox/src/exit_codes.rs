//! Exit codes for the CLI

use blackbox_core::{BlackboxError, ConfigError};
use blackbox_engine::ManifestError;

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// Manifest could not be read or built
pub const MANIFEST_ERROR: i32 = 3;

/// At least one test case failed
pub const TESTS_FAILED: i32 = 4;

/// Exit code for an error that aborted a command
pub fn for_error(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return CONFIG_ERROR;
    }
    if let Some(BlackboxError::Config(_)) = error.downcast_ref::<BlackboxError>() {
        return CONFIG_ERROR;
    }
    if error.downcast_ref::<ManifestError>().is_some() {
        return MANIFEST_ERROR;
    }
    ERROR
}
