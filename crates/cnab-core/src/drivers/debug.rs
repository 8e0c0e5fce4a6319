//! Zero-dependency driver that handles every image type and echoes the
//! operation back as pretty-printed JSON.
//!
//! Kept for the same reason `cnab-go`'s reference drivers carry one:
//! exercising the action engine end-to-end without a container runtime,
//! in tests and in downstream dry-run tooling.

use crate::canonical_json;
use crate::driver::{Driver, OperationResult};
use crate::errors::Result;
use crate::operation::Operation;
use std::io::Write;

#[derive(Debug, Default)]
pub struct DebugDriver;

impl DebugDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for DebugDriver {
    fn handles(&self, _image_type: &str) -> bool {
        true
    }

    async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
        let pretty = serde_json::to_value(canonical_json::canonicalize(serde_json::json!({
            "installation_name": operation.installation_name,
            "revision": operation.revision,
            "action": operation.action,
            "image": operation.image.image,
        })))
        .unwrap_or_default();
        let text = serde_json::to_string_pretty(&pretty).unwrap_or_default();

        if let Some(stdout) = &operation.stdout {
            let mut sink = stdout.lock().expect("stdout sink lock poisoned");
            let _ = writeln!(sink, "{text}");
        }

        Ok(OperationResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, InvocationImage};
    use crate::claim::Claim;
    use crate::credential::CredentialSet;
    use crate::operation;
    use chrono::Utc;

    #[tokio::test]
    async fn handles_any_image_type_and_returns_empty_result() {
        let bundle = Bundle {
            schema_version: "1.0.0".to_string(),
            name: "b".to_string(),
            version: "0.1.0".to_string(),
            invocation_images: vec![InvocationImage {
                content_digest: None,
                image: "x".to_string(),
                image_type: Some("docker".to_string()),
                media_type: None,
                size: None,
                labels: None,
            }],
            images: None,
            actions: None,
            parameters: None,
            credentials: None,
            outputs: None,
            definitions: None,
            required_extensions: None,
            custom: None,
            description: None,
            license: None,
            maintainers: None,
            keywords: None,
        };
        let claim = Claim::new("inst", "install", bundle, Utc::now());
        let image = operation::OperationImage {
            image_type: "docker".to_string(),
            image: "x".to_string(),
            content_digest: None,
        };
        let op = operation::assemble(&claim, image, &CredentialSet::new(), false).unwrap();

        let mut driver = DebugDriver::new();
        assert!(driver.handles("anything"));
        let result = driver.run(&op).await.unwrap();
        assert!(result.outputs.is_empty());
        assert!(result.error.is_none());
    }
}
