//! Sub-process driver: invokes an external `cnab-<name>` binary on PATH
//! (or an explicit path), generalizing the CLI-subprocess pattern the
//! Docker driver uses to an arbitrary executable.

use crate::driver::{Driver, OperationResult};
use crate::errors::{CnabError, Result};
use crate::operation::Operation;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::{debug, instrument};

/// Serialized shape written to the driver's stdin — the "Operation JSON"
/// external interface.
#[derive(Serialize)]
struct OperationPayload<'a> {
    installation_name: &'a str,
    revision: &'a str,
    action: &'a str,
    parameters: &'a std::collections::BTreeMap<String, serde_json::Value>,
    image: ImagePayload<'a>,
    environment: &'a HashMap<String, String>,
    files: HashMap<&'a str, String>,
    outputs: &'a HashMap<String, String>,
    #[serde(rename = "Bundle")]
    bundle: &'a crate::bundle::Bundle,
}

#[derive(Serialize)]
struct ImagePayload<'a> {
    #[serde(rename = "imageType")]
    image_type: &'a str,
    image: &'a str,
    #[serde(rename = "contentDigest", skip_serializing_if = "Option::is_none")]
    content_digest: &'a Option<String>,
}

/// Drives an external `cnab-<name>` executable.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    /// The executable name or path (without the `cnab-` prefix when it's
    /// a PATH lookup name; callers that already know the binary's full
    /// name/path pass it as-is).
    binary: String,
}

impl CommandDriver {
    /// Construct a driver for `cnab-<name>`, discovered on PATH.
    pub fn named(name: &str) -> Self {
        Self {
            binary: format!("cnab-{name}"),
        }
    }

    /// Construct a driver that invokes an explicit executable path.
    pub fn at_path(path: impl Into<String>) -> Self {
        Self { binary: path.into() }
    }

    #[instrument(skip(self))]
    async fn discover_handled_types(&self) -> Result<Vec<String>> {
        let output = TokioCommand::new(&self.binary)
            .arg("--handles")
            .output()
            .await
            .map_err(|e| CnabError::driver(format!("failed to invoke {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(CnabError::driver(format!(
                "{} --handles exited with {}",
                self.binary, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim().split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    }
}

impl Driver for CommandDriver {
    fn handles(&self, image_type: &str) -> bool {
        // `--handles` requires spawning the binary; callers that need a
        // synchronous answer should call `discover_handled_types` ahead
        // of time and cache it. As a best-effort synchronous fallback we
        // accept the common CNAB image types.
        image_type == "docker" || image_type == "oci"
    }

    #[instrument(skip(self, operation), fields(binary = %self.binary, action = %operation.action))]
    async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
        let output_dir = TempDir::new()
            .map_err(|e| CnabError::driver(format!("failed to create CNAB_OUTPUT_DIR: {e}")))?;

        let files: HashMap<&str, String> = operation
            .files
            .iter()
            .map(|(path, bytes)| (path.as_str(), String::from_utf8_lossy(bytes).to_string()))
            .collect();

        let payload = OperationPayload {
            installation_name: &operation.installation_name,
            revision: &operation.revision,
            action: &operation.action,
            parameters: &operation.parameters,
            image: ImagePayload {
                image_type: &operation.image.image_type,
                image: &operation.image.image,
                content_digest: &operation.image.content_digest,
            },
            environment: &operation.environment,
            files,
            outputs: &operation.outputs,
            bundle: &operation.bundle,
        };
        let stdin_json = serde_json::to_vec(&payload)
            .map_err(|e| CnabError::driver(format!("failed to serialize operation: {e}")))?;

        let vars: Vec<String> = operation.environment.keys().cloned().collect();

        debug!(output_dir = %output_dir.path().display(), "invoking command driver");

        let mut child = TokioCommand::new(&self.binary)
            .envs(&operation.environment)
            .env("CNAB_OUTPUT_DIR", output_dir.path())
            .env("CNAB_VARS", vars.join(" "))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CnabError::driver(format!("failed to spawn {}: {e}", self.binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&stdin_json)
                .await
                .map_err(|e| CnabError::driver(format!("failed to write operation to stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CnabError::driver(format!("failed waiting for {}: {e}", self.binary)))?;

        let mut log = output.stdout.clone();
        log.extend_from_slice(&output.stderr);

        if let Some(sink) = &operation.stdout {
            let mut sink = sink.lock().expect("stdout sink lock poisoned");
            let _ = sink.write_all(&output.stdout);
        }
        if let Some(sink) = &operation.stderr {
            let mut sink = sink.lock().expect("stderr sink lock poisoned");
            let _ = sink.write_all(&output.stderr);
        }

        let mut outputs = HashMap::new();
        for (container_path, name) in &operation.outputs {
            let file_name = container_path.rsplit('/').next().unwrap_or(name);
            let path = output_dir.path().join(file_name);
            if path.exists() {
                let bytes = std::fs::read(&path)
                    .map_err(|e| CnabError::driver(format!("failed to read output {name}: {e}")))?;
                outputs.insert(name.clone(), bytes);
            }
        }

        let error = if output.status.success() {
            None
        } else {
            Some(format!("{} exited with {}", self.binary, output.status))
        };

        Ok(OperationResult { outputs, log, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_docker_and_oci_as_fallback() {
        let driver = CommandDriver::named("helm");
        assert!(driver.handles("docker"));
        assert!(driver.handles("oci"));
        assert!(!driver.handles("qemu"));
    }

    #[test]
    fn named_prefixes_with_cnab() {
        let driver = CommandDriver::named("helm");
        assert_eq!(driver.binary, "cnab-helm");
    }

    #[test]
    fn at_path_uses_exact_string() {
        let driver = CommandDriver::at_path("/usr/local/bin/cnab-helm");
        assert_eq!(driver.binary, "/usr/local/bin/cnab-helm");
    }
}
