//! Bounded JSON Schema subset used by bundle `definitions` entries.
//!
//! Covers the Draft-07/2019 keywords a bundle actually needs: `type`,
//! `default`, `enum`, numeric bounds, string bounds/pattern/format,
//! `contentEncoding=base64`, object `properties`/`required`/
//! `additionalProperties`, array `items`/`additionalItems`, `writeOnly`,
//! the `allOf`/`anyOf`/`oneOf`/`not` composition keywords, and the
//! non-validating `$ref`/`$id`/`$schema`/`$comment` passthroughs.

use crate::errors::{CnabError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One `definitions` table entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Definition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<TypeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#enum: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "exclusiveMinimum")]
    pub exclusive_minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "exclusiveMaximum")]
    pub exclusive_maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "minLength")]
    pub min_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "maxLength")]
    pub max_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "contentEncoding")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "additionalProperties")]
    pub additional_properties: Option<AdditionalProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "additionalItems")]
    pub additional_items: Option<AdditionalProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "writeOnly")]
    pub write_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "allOf")]
    pub all_of: Option<Vec<Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "anyOf")]
    pub any_of: Option<Vec<Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "oneOf")]
    pub one_of: Option<Vec<Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "$ref")]
    pub schema_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "$id")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "$comment")]
    pub comment: Option<String>,
}

/// Either a boolean (`true` permits anything, `false` forbids it) or a
/// nested schema, as JSON Schema allows for `additionalProperties`/
/// `additionalItems`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    Bool(bool),
    Schema(Box<Definition>),
}

/// `type` as either a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSet {
    Single(String),
    Multi(Vec<String>),
}

const KNOWN_TYPES: &[&str] = &[
    "null", "boolean", "integer", "number", "string", "object", "array",
];

/// A single validation failure with a JSON-pointer path to the offending
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Definition {
    /// Returns the declared type(s), or an error if `type` is present but
    /// neither a string nor a homogeneous array of strings.
    pub fn get_type(&self) -> Result<Option<Vec<String>>> {
        match &self.schema_type {
            None => Ok(None),
            Some(TypeSet::Single(s)) => {
                validate_known_type(s)?;
                Ok(Some(vec![s.clone()]))
            }
            Some(TypeSet::Multi(types)) => {
                for t in types {
                    validate_known_type(t)?;
                }
                Ok(Some(types.clone()))
            }
        }
    }

    /// Validate `value` against this definition, collecting every failure
    /// rather than stopping at the first one. Never returns `Err` for a
    /// value that merely fails validation — only for a malformed schema.
    pub fn validate(&self, value: &Value) -> Result<Vec<ValidationError>> {
        let mut errors = Vec::new();
        self.validate_at("", value, &mut errors)?;
        Ok(errors)
    }

    fn validate_at(&self, path: &str, value: &Value, errors: &mut Vec<ValidationError>) -> Result<()> {
        if let Some(types) = self.get_type()? {
            if !types.iter().any(|t| json_type_matches(value, t)) {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: format!(
                        "value is not any of the expected types ({}) because it is \"{}\"",
                        types.join(", "),
                        json_type_name(value)
                    ),
                });
                return Ok(());
            }
        }

        if let Some(allowed) = &self.r#enum {
            if !allowed.contains(value) {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: "value is not one of the enumerated values".to_string(),
                });
            }
        }

        if let Value::Number(n) = value {
            let f = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = self.minimum {
                if f < min {
                    errors.push(ValidationError { path: path.to_string(), message: format!("value {f} is less than minimum {min}") });
                }
            }
            if let Some(max) = self.maximum {
                if f > max {
                    errors.push(ValidationError { path: path.to_string(), message: format!("value {f} is greater than maximum {max}") });
                }
            }
            if let Some(min) = self.exclusive_minimum {
                if f <= min {
                    errors.push(ValidationError { path: path.to_string(), message: format!("value {f} is not greater than exclusive minimum {min}") });
                }
            }
            if let Some(max) = self.exclusive_maximum {
                if f >= max {
                    errors.push(ValidationError { path: path.to_string(), message: format!("value {f} is not less than exclusive maximum {max}") });
                }
            }
        }

        if let Value::String(s) = value {
            if let Some(min) = self.min_length {
                if (s.chars().count() as u64) < min {
                    errors.push(ValidationError { path: path.to_string(), message: format!("string is shorter than minLength {min}") });
                }
            }
            if let Some(max) = self.max_length {
                if (s.chars().count() as u64) > max {
                    errors.push(ValidationError { path: path.to_string(), message: format!("string is longer than maxLength {max}") });
                }
            }
            if let Some(pattern) = &self.pattern {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| CnabError::schema(format!("invalid pattern {pattern:?}: {e}")))?;
                if !re.is_match(s) {
                    errors.push(ValidationError { path: path.to_string(), message: format!("string does not match pattern {pattern:?}") });
                }
            }
            if let Some(encoding) = &self.content_encoding {
                match encoding.as_str() {
                    "base64" => {
                        use base64::Engine;
                        if base64::engine::general_purpose::STANDARD.decode(s).is_err() {
                            errors.push(ValidationError {
                                path: path.to_string(),
                                message: format!("invalid base64 value: {s:?}"),
                            });
                        }
                    }
                    other => {
                        errors.push(ValidationError {
                            path: path.to_string(),
                            message: format!("unrecognized contentEncoding {other:?}"),
                        });
                    }
                }
            }
        }

        if let Value::Object(obj) = value {
            if let Some(required) = &self.required {
                for name in required {
                    if !obj.contains_key(name) {
                        errors.push(ValidationError {
                            path: format!("{path}/{name}"),
                            message: format!("missing required property {name:?}"),
                        });
                    }
                }
            }
            if let Some(props) = &self.properties {
                for (name, sub) in props {
                    if let Some(v) = obj.get(name) {
                        sub.validate_at(&format!("{path}/{name}"), v, errors)?;
                    }
                }
            }
            if let Some(AdditionalProperties::Bool(false)) = &self.additional_properties {
                let declared: Vec<&String> = self.properties.iter().flat_map(|p| p.keys()).collect();
                for key in obj.keys() {
                    if !declared.contains(&key) {
                        errors.push(ValidationError {
                            path: format!("{path}/{key}"),
                            message: format!("additional property {key:?} is not allowed"),
                        });
                    }
                }
            } else if let Some(AdditionalProperties::Schema(sub)) = &self.additional_properties {
                let declared: Vec<&String> = self.properties.iter().flat_map(|p| p.keys()).collect();
                for (key, v) in obj.iter() {
                    if !declared.contains(&key) {
                        sub.validate_at(&format!("{path}/{key}"), v, errors)?;
                    }
                }
            }
        }

        if let Value::Array(items) = value {
            if let Some(item_schema) = &self.items {
                for (i, item) in items.iter().enumerate() {
                    item_schema.validate_at(&format!("{path}/{i}"), item, errors)?;
                }
            }
        }

        for sub in self.all_of.iter().flatten() {
            sub.validate_at(path, value, errors)?;
        }
        if let Some(variants) = &self.any_of {
            let mut all_sub_errors = Vec::new();
            let mut matched = false;
            for sub in variants {
                let mut sub_errors = Vec::new();
                sub.validate_at(path, value, &mut sub_errors)?;
                if sub_errors.is_empty() {
                    matched = true;
                    break;
                }
                all_sub_errors.extend(sub_errors);
            }
            if !matched {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: "value matches none of the anyOf schemas".to_string(),
                });
            }
        }
        if let Some(variants) = &self.one_of {
            let mut matches = 0;
            for sub in variants {
                let mut sub_errors = Vec::new();
                sub.validate_at(path, value, &mut sub_errors)?;
                if sub_errors.is_empty() {
                    matches += 1;
                }
            }
            if matches != 1 {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: format!("value matches {matches} of the oneOf schemas, expected exactly 1"),
                });
            }
        }
        if let Some(not_schema) = &self.not {
            let mut sub_errors = Vec::new();
            not_schema.validate_at(path, value, &mut sub_errors)?;
            if sub_errors.is_empty() {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: "value must not match the `not` schema".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Normalize `value` toward the declared type where unambiguous.
    /// Returns the original value unchanged when no coercion rule applies.
    pub fn coerce_value(&self, value: Value) -> Result<Value> {
        let Some(types) = self.get_type()? else {
            return Ok(value);
        };

        for target in &types {
            if json_type_matches(&value, target) {
                return Ok(value);
            }
        }

        for target in &types {
            match (target.as_str(), &value) {
                ("integer", Value::Number(n)) => {
                    if let Some(f) = n.as_f64() {
                        if f.fract() == 0.0 {
                            return Ok(Value::from(f as i64));
                        }
                    }
                }
                ("boolean", Value::String(s)) => {
                    if s == "true" {
                        return Ok(Value::Bool(true));
                    }
                    if s == "false" {
                        return Ok(Value::Bool(false));
                    }
                }
                ("number", Value::String(s)) | ("integer", Value::String(s)) => {
                    if let Ok(f) = s.parse::<f64>() {
                        return Ok(serde_json::Number::from_f64(f)
                            .map(Value::Number)
                            .unwrap_or(value.clone()));
                    }
                }
                ("object", Value::String(s)) | ("array", Value::String(s)) => {
                    if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                        return Ok(parsed);
                    }
                }
                _ => {}
            }
        }

        Ok(value)
    }
}

fn validate_known_type(t: &str) -> Result<()> {
    if KNOWN_TYPES.contains(&t) {
        Ok(())
    } else {
        Err(CnabError::schema(format!("unknown schema type {t:?}")))
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
    }
}

/// `integer` satisfies `number` implicitly, per the spec's type-containment rule.
pub(crate) fn json_type_matches(value: &Value, target: &str) -> bool {
    let actual = json_type_name(value);
    if actual == target {
        return true;
    }
    target == "number" && actual == "integer"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_type_single() {
        let def: Definition = serde_json::from_value(json!({"type": "string"})).unwrap();
        assert_eq!(def.get_type().unwrap(), Some(vec!["string".to_string()]));
    }

    #[test]
    fn get_type_rejects_unknown() {
        let def: Definition = serde_json::from_value(json!({"type": "bogus"})).unwrap();
        assert!(def.get_type().is_err());
    }

    #[test]
    fn validate_minimum_maximum() {
        let def: Definition =
            serde_json::from_value(json!({"type": "integer", "minimum": 0, "maximum": 10})).unwrap();
        assert!(def.validate(&json!(5)).unwrap().is_empty());
        assert!(!def.validate(&json!(-1)).unwrap().is_empty());
        assert!(!def.validate(&json!(11)).unwrap().is_empty());
    }

    #[test]
    fn validate_integer_satisfies_number() {
        let def: Definition = serde_json::from_value(json!({"type": "number"})).unwrap();
        assert!(def.validate(&json!(2)).unwrap().is_empty());
    }

    #[test]
    fn content_encoding_base64_invalid() {
        let def: Definition =
            serde_json::from_value(json!({"type": "string", "contentEncoding": "base64"})).unwrap();
        let errors = def.validate(&json!("not base64!!")).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("invalid base64 value"));
    }

    #[test]
    fn content_encoding_unknown_reported() {
        let def: Definition =
            serde_json::from_value(json!({"type": "string", "contentEncoding": "rot13"})).unwrap();
        let errors = def.validate(&json!("abc")).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unrecognized contentEncoding"));
    }

    #[test]
    fn coerce_fractionless_float_to_integer() {
        let def: Definition = serde_json::from_value(json!({"type": "integer"})).unwrap();
        let coerced = def.coerce_value(json!(8080.0)).unwrap();
        assert_eq!(coerced, json!(8080));
    }

    #[test]
    fn coerce_string_bool() {
        let def: Definition = serde_json::from_value(json!({"type": "boolean"})).unwrap();
        assert_eq!(def.coerce_value(json!("true")).unwrap(), json!(true));
        assert_eq!(def.coerce_value(json!("false")).unwrap(), json!(false));
    }

    #[test]
    fn coerce_leaves_undefined_pair_unchanged() {
        let def: Definition = serde_json::from_value(json!({"type": "string"})).unwrap();
        assert_eq!(def.coerce_value(json!(42)).unwrap(), json!(42));
    }

    #[test]
    fn required_properties_reported_with_pointer_path() {
        let def: Definition = serde_json::from_value(json!({
            "type": "object",
            "required": ["name"]
        }))
        .unwrap();
        let errors = def.validate(&json!({})).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/name");
    }
}
