//! Credential definitions: opaque secrets routed to env and/or a file path.

use crate::bundle::RESERVED_OUTPUTS_PATH;
use crate::errors::{CnabError, Result};
use crate::parameter::Destination;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "applyTo")]
    pub apply_to: Option<Vec<String>>,
}

impl Credential {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    pub fn applies_to(&self, action: &str) -> bool {
        match &self.apply_to {
            None => true,
            Some(actions) => actions.iter().any(|a| a == action),
        }
    }

    /// Validate: at least one of {env, path} is set, and the path (if set)
    /// does not fall under the reserved outputs path.
    pub fn validate_destination(&self, name: &str) -> Result<()> {
        if self.destination.env.is_none() && self.destination.path.is_none() {
            return Err(CnabError::schema(format!(
                "credential {name:?} must set at least one of env or path"
            )));
        }
        if let Some(path) = &self.destination.path {
            if path.starts_with(RESERVED_OUTPUTS_PATH) {
                return Err(CnabError::schema(format!(
                    "credential {name:?} destination path {path:?} falls under the reserved outputs path {RESERVED_OUTPUTS_PATH}"
                )));
            }
        }
        Ok(())
    }
}

/// A resolved credential value supplied by the caller at action time. The
/// core never resolves these from a secret store itself (see crate docs).
pub type CredentialSet = std::collections::BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_env_or_path() {
        let cred = Credential {
            description: None,
            destination: Destination::default(),
            required: Some(true),
            apply_to: None,
        };
        assert!(cred.validate_destination("secret_one").is_err());
    }

    #[test]
    fn env_only_is_valid() {
        let cred = Credential {
            description: None,
            destination: Destination {
                env: Some("SECRET_ONE".to_string()),
                path: None,
            },
            required: Some(true),
            apply_to: None,
        };
        assert!(cred.validate_destination("secret_one").is_ok());
    }
}
