//! The bundle document: invocation images, actions, parameters,
//! credentials, outputs, and the `definitions` schema table.

use crate::canonical_json;
use crate::credential::Credential;
use crate::errors::{CnabError, Result};
use crate::output::Output;
use crate::parameter::Parameter;
use crate::schema::Definition;
use crate::semver_utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::instrument;

/// Reserved path prefix for captured outputs; no parameter, credential or
/// output destination may fall under it.
pub const RESERVED_OUTPUTS_PATH: &str = "/cnab/app/outputs";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl Image {
    /// The type of this image, defaulting to `"oci"` when unspecified.
    pub fn image_type_or_default(&self) -> &str {
        self.image_type.as_deref().unwrap_or("oci")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationImage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl InvocationImage {
    pub fn image_type_or_default(&self) -> &str {
        self.image_type.as_deref().unwrap_or("oci")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Maintainer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Action {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub modifies: bool,
    #[serde(default)]
    pub stateless: bool,
}

/// The CNAB bundle descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    pub invocation_images: Vec<InvocationImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Image>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<BTreeMap<String, Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, Parameter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BTreeMap<String, Credential>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, Output>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions: Option<BTreeMap<String, Definition>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "requiredExtensions")]
    pub required_extensions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainers: Option<Vec<Maintainer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

impl Bundle {
    /// Parse a bundle from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let bundle: Bundle = canonical_json::from_str(text)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Parse a bundle from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let bundle: Bundle = serde_yaml::from_str(text)
            .map_err(|e| CnabError::schema(format!("invalid bundle YAML: {e}")))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Open and parse a bundle document, choosing JSON or YAML by
    /// extension (`.yaml`/`.yml` vs anything else).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut text = String::new();
        std::fs::File::open(path)?.read_to_string(&mut text)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Serialize to canonical JSON (sorted keys, no whitespace) so digests
    /// computed over the bundle are stable.
    pub fn to_canonical_json(&self) -> Result<String> {
        canonical_json::to_canonical_string(self)
    }

    /// Clone this bundle, deep-copying image label maps rather than
    /// sharing them.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Validate the bundle's structural invariants.
    ///
    /// - At least one invocation image.
    /// - `version` is not the literal string `"latest"`.
    /// - `schemaVersion` parses as semver (tolerant leading `v`).
    /// - Every declared required extension is present in `custom`.
    /// - Every parameter/credential/output passes its own validation.
    #[instrument(skip(self), fields(bundle = %self.name))]
    pub fn validate(&self) -> Result<()> {
        if self.invocation_images.is_empty() {
            return Err(CnabError::schema("no invocationImages are defined"));
        }

        if !semver_utils::is_valid_bundle_version(&self.version) {
            return Err(CnabError::schema(format!(
                "bundle version {:?} must not be \"latest\" and must parse as semver",
                self.version
            )));
        }

        if semver_utils::parse_version(&self.schema_version).is_none() {
            return Err(CnabError::schema(format!(
                "schemaVersion {:?} does not parse as semver",
                self.schema_version
            )));
        }

        if let Some(required) = &self.required_extensions {
            let custom = self.custom.as_ref();
            for ext in required {
                let present = custom.map(|c| c.contains_key(ext)).unwrap_or(false);
                if !present {
                    return Err(CnabError::schema(format!(
                        "required extension {ext:?} is not present in custom"
                    )));
                }
            }
        }

        if let Some(parameters) = &self.parameters {
            for (name, param) in parameters {
                param.validate_destination(name)?;
            }
        }

        if let Some(credentials) = &self.credentials {
            for (name, cred) in credentials {
                cred.validate_destination(name)?;
            }
        }

        Ok(())
    }

    /// Look up a definition by name, failing if it is not declared.
    pub fn definition(&self, name: &str) -> Result<&Definition> {
        self.definitions
            .as_ref()
            .and_then(|defs| defs.get(name))
            .ok_or_else(|| CnabError::schema(format!("no such definition {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_bundle_json() -> &'static str {
        r#"{
            "schemaVersion": "1.0.0",
            "name": "helloworld",
            "version": "0.1.0",
            "invocationImages": [{"image": "example.com/helloworld:0.1.0", "imageType": "docker"}]
        }"#
    }

    #[test]
    fn parses_minimal_bundle() {
        let bundle = Bundle::from_json(minimal_bundle_json()).unwrap();
        assert_eq!(bundle.name, "helloworld");
        assert_eq!(bundle.invocation_images.len(), 1);
    }

    #[test]
    fn round_trip_canonical_json_is_idempotent() {
        let bundle = Bundle::from_json(minimal_bundle_json()).unwrap();
        let once = bundle.to_canonical_json().unwrap();
        let parsed = Bundle::from_json(&once).unwrap();
        let twice = parsed.to_canonical_json().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_latest_version() {
        let text = minimal_bundle_json().replace("\"0.1.0\"", "\"latest\"");
        assert!(Bundle::from_json(&text).is_err());
    }

    #[test]
    fn rejects_empty_invocation_images() {
        let text = minimal_bundle_json().replace(
            r#"[{"image": "example.com/helloworld:0.1.0", "imageType": "docker"}]"#,
            "[]",
        );
        assert!(Bundle::from_json(&text).is_err());
    }

    #[test]
    fn rejects_missing_required_extension() {
        let mut bundle = Bundle::from_json(minimal_bundle_json()).unwrap();
        bundle.required_extensions = Some(vec!["com.example.ext".to_string()]);
        assert!(bundle.validate().is_err());
        bundle.custom = Some(BTreeMap::from([(
            "com.example.ext".to_string(),
            serde_json::json!(true),
        )]));
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn parses_yaml_form() {
        let yaml = "schemaVersion: v1.0.0\nname: helloworld\nversion: 0.1.0\ninvocationImages:\n  - image: example.com/helloworld:0.1.0\n    imageType: docker\n";
        let bundle = Bundle::from_yaml(yaml).unwrap();
        assert_eq!(bundle.name, "helloworld");
    }
}
