//! The driver contract: `handles` + `run`, plus an optional settings
//! protocol drivers may expose.

use crate::errors::{CnabError, Result};
use crate::operation::Operation;
use std::collections::HashMap;

/// The outcome of a driver attempting to run an operation.
///
/// `error` is distinct from the `Result<OperationResult>` a driver's
/// `run` returns: a `Result::Err` means the driver could not attempt
/// execution at all (daemon unreachable, image pull failure); `error`
/// being `Some` means the container ran and the invocation image itself
/// reported failure.
#[derive(Debug, Clone, Default)]
pub struct OperationResult {
    /// Captured outputs by name, as raw bytes.
    pub outputs: HashMap<String, Vec<u8>>,
    /// Combined stdout/stderr log buffer captured for this run.
    pub log: Vec<u8>,
    /// Set when the invocation image ran and reported failure.
    pub error: Option<String>,
}

/// The uniform container-execution contract every driver implements.
#[allow(async_fn_in_trait)]
pub trait Driver {
    /// Whether this driver can run an invocation image of `image_type`
    /// (e.g. `"docker"`, `"oci"`).
    fn handles(&self, image_type: &str) -> bool;

    /// Run `operation`, returning its outcome. An `Err` means execution
    /// never proceeded; `Ok` with `OperationResult.error` set means the
    /// container ran and failed.
    async fn run(&mut self, operation: &Operation) -> Result<OperationResult>;

    /// Recognized settings and their help text, for drivers that expose a
    /// settings protocol. Drivers with no configurable settings return an
    /// empty map.
    fn config(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Apply `settings`. The default implementation rejects any settings
    /// since `config()` advertises none; drivers that accept settings
    /// override both.
    fn set_config(&mut self, settings: HashMap<String, String>) -> Result<()> {
        if settings.is_empty() {
            Ok(())
        } else {
            Err(CnabError::driver(
                "this driver does not accept any configuration settings",
            ))
        }
    }
}

/// Parse a driver boolean setting, accepting `"1"/"0"` and
/// case-insensitive `"true"/"false"`. Any other value is an error —
/// unifies `CLEANUP_CONTAINERS` and `PULL_ALWAYS` parsing under one
/// convention rather than special-casing either.
pub fn parse_bool_setting(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(CnabError::driver(format!(
            "unrecognized value {other:?} for setting {key}: expected one of 1, 0, true, false"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_word_forms() {
        assert!(parse_bool_setting("CLEANUP_CONTAINERS", "1").unwrap());
        assert!(parse_bool_setting("CLEANUP_CONTAINERS", "true").unwrap());
        assert!(parse_bool_setting("CLEANUP_CONTAINERS", "TRUE").unwrap());
        assert!(!parse_bool_setting("PULL_ALWAYS", "0").unwrap());
        assert!(!parse_bool_setting("PULL_ALWAYS", "false").unwrap());
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(parse_bool_setting("CLEANUP_CONTAINERS", "yes").is_err());
    }
}
