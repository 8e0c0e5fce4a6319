//! Output definitions: the file an invocation image writes, and the
//! definition its bytes are validated against.

use serde::{Deserialize, Serialize};

/// An output reserved for the engine's own log capture; never overwritten
/// by a driver-reported output of the same name.
pub const RESERVED_LOGS_OUTPUT: &str = "io.cnab.outputs.invocationImageLogs";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "applyTo")]
    pub apply_to: Option<Vec<String>>,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Output {
    pub fn applies_to(&self, action: &str) -> bool {
        match &self.apply_to {
            None => true,
            Some(actions) => actions.iter().any(|a| a == action),
        }
    }
}

/// Per-output metadata recorded in a claim result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub content_digest: String,
    pub generated_by_bundle: bool,
}
