//! Parameter definitions: destination routing, applicability, defaults.

use crate::bundle::{Bundle, RESERVED_OUTPUTS_PATH};
use crate::errors::{CnabError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Where a parameter (or credential) value is placed inside the invocation
/// image: an environment variable name and/or a filesystem path. Both may
/// be set; neither is exclusive of the other.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Destination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "applyTo")]
    pub apply_to: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,
}

impl Parameter {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.unwrap_or(false)
    }

    /// `applyTo` unset means the parameter applies to every action.
    pub fn applies_to(&self, action: &str) -> bool {
        match &self.apply_to {
            None => true,
            Some(actions) => actions.iter().any(|a| a == action),
        }
    }

    /// Validate that this parameter's destination does not fall under the
    /// reserved outputs path.
    pub fn validate_destination(&self, name: &str) -> Result<()> {
        if let Some(path) = &self.destination.path {
            if path.starts_with(RESERVED_OUTPUTS_PATH) {
                return Err(CnabError::schema(format!(
                    "parameter {name:?} destination path {path:?} falls under the reserved outputs path {RESERVED_OUTPUTS_PATH}"
                )));
            }
        }
        Ok(())
    }

    /// The environment variable a parameter is written to when no explicit
    /// destination env is set: `CNAB_P_<UPPERCASE_NAME>`.
    pub fn default_env_var(name: &str) -> String {
        format!("CNAB_P_{}", name.to_uppercase())
    }
}

/// Resolve every in-scope parameter for `action` to its effective value.
///
/// 1. Skip parameters whose `applyTo` excludes `action`.
/// 2. Use the supplied value, else the definition's default, else fail if
///    required.
/// 3. Reject a supplied value that differs from `current` for an
///    immutable parameter.
/// 4. Validate (when required or the effective value is non-null) and
///    coerce the final value.
pub fn values_or_defaults(
    supplied: &BTreeMap<String, Value>,
    current: &BTreeMap<String, Value>,
    bundle: &Bundle,
    action: &str,
) -> Result<BTreeMap<String, Value>> {
    let mut resolved = BTreeMap::new();
    let Some(parameters) = &bundle.parameters else {
        return Ok(resolved);
    };

    for (name, param) in parameters {
        if !param.applies_to(action) {
            continue;
        }

        let definition = param
            .definition
            .as_ref()
            .map(|d| bundle.definition(d))
            .transpose()?;

        let value = if let Some(v) = supplied.get(name) {
            Some(v.clone())
        } else if param.is_required() {
            return Err(CnabError::parameter(format!("parameter {name} is required")));
        } else {
            definition.and_then(|d| d.default.clone())
        };

        if param.is_immutable() {
            if let (Some(current_value), Some(new_value)) = (current.get(name), &value) {
                if current_value != new_value {
                    return Err(CnabError::parameter(format!(
                        "parameter {name} is immutable and cannot be overridden with value {new_value}"
                    )));
                }
            }
        }

        let needs_validation = param.is_required() || value.as_ref().map(|v| !v.is_null()).unwrap_or(false);
        let final_value = if let Some(v) = value {
            let coerced = match definition {
                Some(def) => def.coerce_value(v)?,
                None => v,
            };
            if needs_validation {
                if let Some(def) = definition {
                    let errors = def.validate(&coerced)?;
                    if let Some(first) = errors.first() {
                        return Err(CnabError::parameter(format!(
                            "cannot use value {coerced} as parameter {name}: {}",
                            first.message
                        )));
                    }
                }
            }
            Some(coerced)
        } else {
            None
        };

        if let Some(v) = final_value {
            resolved.insert(name.clone(), v);
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(apply_to: Option<Vec<&str>>) -> Parameter {
        Parameter {
            apply_to: apply_to.map(|v| v.into_iter().map(String::from).collect()),
            definition: Some("port".to_string()),
            description: None,
            destination: Destination::default(),
            required: Some(true),
            immutable: None,
        }
    }

    #[test]
    fn applies_to_all_actions_when_unset() {
        let p = param(None);
        assert!(p.applies_to("install"));
        assert!(p.applies_to("anything"));
    }

    #[test]
    fn applies_to_respects_apply_to_list() {
        let p = param(Some(vec!["test"]));
        assert!(p.applies_to("test"));
        assert!(!p.applies_to("install"));
    }

    #[test]
    fn default_env_var_uppercases() {
        assert_eq!(Parameter::default_env_var("host"), "CNAB_P_HOST");
    }

    #[test]
    fn rejects_reserved_outputs_path() {
        let mut p = param(None);
        p.destination.path = Some("/cnab/app/outputs/evil".to_string());
        assert!(p.validate_destination("evil").is_err());
    }

    fn bundle_with_required_applies_to_test() -> Bundle {
        let json = r#"{
            "schemaVersion": "1.0.0",
            "name": "b",
            "version": "0.1.0",
            "invocationImages": [{"image": "x", "imageType": "docker"}],
            "definitions": {"string": {"type": "string"}},
            "parameters": {
                "param_test": {
                    "definition": "string",
                    "destination": {},
                    "required": true,
                    "applyTo": ["test"]
                }
            }
        }"#;
        Bundle::from_json(json).unwrap()
    }

    #[test]
    fn required_param_only_enforced_for_applicable_action() {
        let bundle = bundle_with_required_applies_to_test();
        let empty = BTreeMap::new();
        assert!(values_or_defaults(&empty, &empty, &bundle, "install").is_ok());
        let err = values_or_defaults(&empty, &empty, &bundle, "test").unwrap_err();
        assert!(err.to_string().contains("param_test"));
    }

    #[test]
    fn immutable_parameter_with_same_value_succeeds() {
        let json = r#"{
            "schemaVersion": "1.0.0",
            "name": "b",
            "version": "0.1.0",
            "invocationImages": [{"image": "x", "imageType": "docker"}],
            "definitions": {"string": {"type": "string"}},
            "parameters": {
                "p": {"definition": "string", "destination": {}, "immutable": true}
            }
        }"#;
        let bundle = Bundle::from_json(json).unwrap();
        let mut current = BTreeMap::new();
        current.insert("p".to_string(), Value::String("same".to_string()));
        let mut supplied = BTreeMap::new();
        supplied.insert("p".to_string(), Value::String("same".to_string()));
        assert!(values_or_defaults(&supplied, &current, &bundle, "install").is_ok());

        let mut differing = BTreeMap::new();
        differing.insert("p".to_string(), Value::String("different".to_string()));
        assert!(values_or_defaults(&differing, &current, &bundle, "install").is_err());
    }
}
