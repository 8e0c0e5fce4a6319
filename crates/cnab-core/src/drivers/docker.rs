//! Docker CLI-backed driver: launches the invocation image on the local
//! Docker daemon by shelling out to the `docker` binary, the same
//! CLI-subprocess pattern the teacher's Docker integration uses rather
//! than a bundled HTTP client.

use crate::driver::{parse_bool_setting, Driver, OperationResult};
use crate::errors::{CnabError, Result};
use crate::operation::Operation;
use std::collections::HashMap;
use std::io::Write;
use tar::{Builder, Header};
use tokio::process::Command as TokioCommand;
use tracing::{debug, instrument, warn};

const ENTRYPOINT: &str = "/cnab/app/run";
const OUTPUTS_DIR: &str = "/cnab/app/outputs";

/// Docker driver settings, applied via [`Driver::set_config`].
#[derive(Debug, Clone, Default)]
struct DockerSettings {
    pull_always: bool,
    quiet: bool,
    cleanup_containers: bool,
    network: Option<String>,
}

/// Runs invocation images against the local Docker daemon via the
/// `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    docker_path: String,
    settings: DockerSettings,
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerDriver {
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
            settings: DockerSettings {
                cleanup_containers: true,
                ..Default::default()
            },
        }
    }

    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            settings: DockerSettings {
                cleanup_containers: true,
                ..Default::default()
            },
        }
    }

    async fn run_docker(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(args = %args.join(" "), "running docker");
        TokioCommand::new(&self.docker_path)
            .args(args)
            .output()
            .await
            .map_err(|e| CnabError::driver(format!("failed to execute docker {}: {e}", args.join(" "))))
    }

    /// Inspect the image locally; `Ok(None)` means it is not present.
    async fn inspect_image(&self, image: &str) -> Result<Option<serde_json::Value>> {
        let output = self.run_docker(&["image", "inspect", image]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
            .map_err(|e| CnabError::driver(format!("failed to parse docker image inspect output: {e}")))?;
        Ok(parsed.into_iter().next())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let output = self.run_docker(&["pull", image]).await?;
        if !output.status.success() {
            return Err(CnabError::driver(format!(
                "failed to pull image {image}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Validate the locally inspected image's repo digests against a
    /// pinned content digest: any match accepts, missing digest metadata
    /// or a mismatch fails.
    fn validate_content_digest(inspected: &serde_json::Value, pinned: &str) -> Result<()> {
        let repo_digests = inspected
            .get("RepoDigests")
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or(&[]);

        if repo_digests.is_empty() {
            return Err(CnabError::driver(format!("image has no repo digests, cannot verify {pinned}")));
        }

        let matches = repo_digests.iter().any(|d| {
            d.as_str()
                .map(|s| s.ends_with(pinned.trim_start_matches("sha256:")) || s == pinned)
                .unwrap_or(false)
        });

        if matches {
            Ok(())
        } else {
            Err(CnabError::driver(format!("content digest mismatch: expected {pinned}")))
        }
    }

    /// Build a tar stream from the operation's files map: a header for
    /// every parent directory (mode 0700) plus the file itself (mode
    /// 0600), owned by the container's configured user (default uid 0),
    /// so a non-root invocation image can read injected files.
    fn build_tar(files: &HashMap<String, Vec<u8>>, uid: u64) -> Result<Vec<u8>> {
        let mut archive = Builder::new(Vec::new());
        let mut seen_dirs = std::collections::BTreeSet::new();

        let mut paths: Vec<&String> = files.keys().collect();
        paths.sort();

        for path in paths {
            let contents = &files[path];
            let trimmed = path.trim_start_matches('/');
            let components: Vec<&str> = trimmed.split('/').collect();
            let parents = if components.is_empty() { &[][..] } else { &components[..components.len() - 1] };
            let mut acc = String::new();
            for component in parents {
                acc.push_str(component);
                acc.push('/');
                if seen_dirs.insert(acc.clone()) {
                    let mut header = Header::new_gnu();
                    header.set_path(&acc).map_err(|e| CnabError::driver(format!("tar header: {e}")))?;
                    header.set_mode(0o700);
                    header.set_uid(uid);
                    header.set_gid(uid);
                    header.set_size(0);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_cksum();
                    archive
                        .append(&header, std::io::empty())
                        .map_err(|e| CnabError::driver(format!("tar append dir: {e}")))?;
                }
            }

            let mut header = Header::new_gnu();
            header.set_path(trimmed).map_err(|e| CnabError::driver(format!("tar header: {e}")))?;
            header.set_mode(0o600);
            header.set_uid(uid);
            header.set_gid(uid);
            header.set_size(contents.len() as u64);
            header.set_cksum();
            archive
                .append(&header, contents.as_slice())
                .map_err(|e| CnabError::driver(format!("tar append file: {e}")))?;
        }

        archive
            .into_inner()
            .map_err(|e| CnabError::driver(format!("failed to finalize tar stream: {e}")))
    }

    /// The container user to own injected files, derived from the image
    /// config; defaults to uid 0 when unspecified or non-numeric.
    fn container_uid(inspected: &serde_json::Value) -> u64 {
        inspected
            .get("Config")
            .and_then(|c| c.get("User"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.split(':').next())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

impl Driver for DockerDriver {
    fn handles(&self, image_type: &str) -> bool {
        image_type == "docker" || image_type == "oci"
    }

    fn config(&self) -> HashMap<String, String> {
        HashMap::from([
            ("PULL_ALWAYS".to_string(), "pull before run when \"1\"".to_string()),
            ("CLEANUP_CONTAINERS".to_string(), "delete container on exit (default true)".to_string()),
            ("DOCKER_NETWORK".to_string(), "attach container to named network".to_string()),
            ("DOCKER_DRIVER_QUIET".to_string(), "suppress driver-level progress output".to_string()),
        ])
    }

    fn set_config(&mut self, settings: HashMap<String, String>) -> Result<()> {
        for (key, value) in settings {
            match key.as_str() {
                "PULL_ALWAYS" => self.settings.pull_always = parse_bool_setting(&key, &value)?,
                "CLEANUP_CONTAINERS" => self.settings.cleanup_containers = parse_bool_setting(&key, &value)?,
                "DOCKER_DRIVER_QUIET" => self.settings.quiet = parse_bool_setting(&key, &value)?,
                "DOCKER_NETWORK" => self.settings.network = Some(value),
                "DOCKER_TLS_VERIFY" | "DOCKER_CERT_PATH" => {
                    // Resolved from the environment by the `docker` CLI itself.
                }
                other => {
                    return Err(CnabError::driver(format!("unrecognized docker driver setting {other}")));
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, operation), fields(image = %operation.image.image))]
    async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
        let image = &operation.image.image;

        let mut inspected = self.inspect_image(image).await?;
        if inspected.is_none() || self.settings.pull_always {
            self.pull_image(image).await?;
            inspected = self.inspect_image(image).await?;
        }
        let inspected = inspected.ok_or_else(|| CnabError::driver(format!("image {image} not found after pull")))?;

        if let Some(pinned) = &operation.image.content_digest {
            Self::validate_content_digest(&inspected, pinned)?;
        }

        let uid = Self::container_uid(&inspected);
        let tar_bytes = Self::build_tar(&operation.files, uid)?;

        let mut create_args: Vec<String> = vec![
            "create".to_string(),
            "--entrypoint".to_string(),
            ENTRYPOINT.to_string(),
        ];
        for (key, value) in &operation.environment {
            create_args.push("-e".to_string());
            create_args.push(format!("{key}={value}"));
        }
        if let Some(network) = &self.settings.network {
            create_args.push("--network".to_string());
            create_args.push(network.clone());
        }
        create_args.push(image.clone());

        let create_args_ref: Vec<&str> = create_args.iter().map(|s| s.as_str()).collect();
        let create_output = self.run_docker(&create_args_ref).await?;
        if !create_output.status.success() {
            return Err(CnabError::driver(format!(
                "failed to create container: {}",
                String::from_utf8_lossy(&create_output.stderr)
            )));
        }
        let container_id = String::from_utf8_lossy(&create_output.stdout).trim().to_string();

        let cleanup = self.settings.cleanup_containers;
        let result = self.run_in_container(&container_id, &tar_bytes, operation).await;

        if cleanup {
            let _ = self.run_docker(&["rm", "-f", &container_id]).await;
        }

        result
    }
}

impl DockerDriver {
    async fn run_in_container(
        &self,
        container_id: &str,
        tar_bytes: &[u8],
        operation: &Operation,
    ) -> Result<OperationResult> {
        use tokio::io::AsyncWriteExt;

        let mut cp_child = TokioCommand::new(&self.docker_path)
            .args(["cp", "-", &format!("{container_id}:/")])
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| CnabError::driver(format!("failed to spawn docker cp: {e}")))?;

        if let Some(mut stdin) = cp_child.stdin.take() {
            stdin
                .write_all(tar_bytes)
                .await
                .map_err(|e| CnabError::driver(format!("failed to stream tar into container: {e}")))?;
        }
        let cp_status = cp_child
            .wait()
            .await
            .map_err(|e| CnabError::driver(format!("docker cp failed: {e}")))?;
        if !cp_status.success() {
            return Err(CnabError::driver("docker cp into container failed"));
        }

        let start_output = self.run_docker(&["start", "-a", container_id]).await?;

        if !self.settings.quiet {
            if let Some(sink) = &operation.stdout {
                let mut sink = sink.lock().expect("stdout sink lock poisoned");
                let _ = sink.write_all(&start_output.stdout);
            }
            if let Some(sink) = &operation.stderr {
                let mut sink = sink.lock().expect("stderr sink lock poisoned");
                let _ = sink.write_all(&start_output.stderr);
            }
        }

        let mut log = start_output.stdout.clone();
        log.extend_from_slice(&start_output.stderr);

        let mut outputs = HashMap::new();
        if !operation.outputs.is_empty() {
            let cp_out = self
                .run_docker(&["cp", &format!("{container_id}:{OUTPUTS_DIR}"), "-"])
                .await;
            match cp_out {
                Ok(out) if out.status.success() => {
                    match parse_outputs_tar(&out.stdout, &operation.outputs) {
                        Ok(found) => outputs = found,
                        Err(e) => warn!(error = %e, "failed to parse outputs tar stream"),
                    }
                }
                _ => {
                    debug!("no outputs directory present in container");
                }
            }
        }

        let error = if start_output.status.success() {
            None
        } else {
            Some(format!("container exited with {}", start_output.status))
        };

        Ok(OperationResult { outputs, log, error })
    }
}

/// Extract files out of a tar stream (as produced by `docker cp`),
/// matching them against the operation's outputs map by basename.
fn parse_outputs_tar(
    tar_bytes: &[u8],
    outputs_map: &HashMap<String, String>,
) -> Result<HashMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut found = HashMap::new();

    let by_basename: HashMap<String, String> = outputs_map
        .iter()
        .map(|(path, name)| {
            let basename = path.rsplit('/').next().unwrap_or(path).to_string();
            (basename, name.clone())
        })
        .collect();

    for entry in archive
        .entries()
        .map_err(|e| CnabError::driver(format!("failed to read outputs tar: {e}")))?
    {
        let mut entry = entry.map_err(|e| CnabError::driver(format!("tar entry error: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| CnabError::driver(format!("tar entry path: {e}")))?
            .to_string_lossy()
            .to_string();
        let basename = path.rsplit('/').next().unwrap_or(&path).to_string();
        if let Some(name) = by_basename.get(&basename) {
            let mut bytes = Vec::new();
            std::io::copy(&mut entry, &mut bytes)
                .map_err(|e| CnabError::driver(format!("failed to read output {name}: {e}")))?;
            found.insert(name.clone(), bytes);
        }
    }

    Ok(found)
}
