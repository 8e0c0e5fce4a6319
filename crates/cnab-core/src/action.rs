//! End-to-end action orchestration: validates a claim, selects a driver's
//! invocation image, assembles the operation, runs the driver, applies
//! default outputs, and builds the terminal claim result. Ties every
//! other module in this crate together.

use crate::bundle::Bundle;
use crate::claim::{Claim, ClaimResult, Status};
use crate::claim_store::ClaimStore;
use crate::credential::CredentialSet;
use crate::driver::{Driver, OperationResult};
use crate::errors::{CnabError, Result};
use crate::operation::{self, Operation};
use crate::output::{OutputMetadata, RESERVED_LOGS_OUTPUT};
use crate::redaction::{self, RedactionConfig};
use crate::schema::{json_type_matches, json_type_name};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{instrument, warn};

/// Applied to the assembled operation before the driver runs; any error
/// aborts the run before invocation.
pub type ConfigureCallback<'a> = &'a (dyn Fn(&mut Operation) -> Result<()> + Send + Sync);

/// Policy controlling which captured outputs `save_operation_result`
/// persists to the claim store.
#[derive(Debug, Clone, Default)]
pub enum OutputSavePolicy {
    #[default]
    SaveAll,
    SaveNamed(Vec<String>),
    SaveNone,
}

impl OutputSavePolicy {
    fn admits(&self, name: &str) -> bool {
        match self {
            Self::SaveAll => true,
            Self::SaveNamed(names) => names.iter().any(|n| n == name),
            Self::SaveNone => false,
        }
    }
}

/// Validate a claim's structural preconditions: schema version, a
/// non-empty installation name, and an action name the bundle knows
/// about (the three built-ins are always known even when undeclared).
pub fn validate_claim(claim: &Claim) -> Result<()> {
    if crate::semver_utils::parse_version(&claim.schema_version).is_none() {
        return Err(CnabError::schema(format!(
            "claim schemaVersion {:?} does not parse as semver",
            claim.schema_version
        )));
    }
    if claim.installation.trim().is_empty() {
        return Err(CnabError::schema("claim installation name must not be empty"));
    }

    let bundle = &claim.bundle;
    let declared = bundle.actions.as_ref().map(|a| a.contains_key(&claim.action)).unwrap_or(false);
    let builtin = matches!(claim.action.as_str(), "install" | "upgrade" | "uninstall");
    if !declared && !builtin {
        return Err(CnabError::schema(format!(
            "action {:?} is not declared by the bundle",
            claim.action
        )));
    }

    Ok(())
}

fn action_is_stateless(bundle: &Bundle, action: &str) -> bool {
    bundle
        .actions
        .as_ref()
        .and_then(|actions| actions.get(action))
        .map(|a| a.stateless)
        .unwrap_or(false)
}

/// Scrub any registered credential values out of a driver's captured log
/// bytes before it reaches a claim result or a caller. Non-UTF-8 logs pass
/// through unscrubbed rather than losing bytes to a lossy re-encode.
fn redact_log(log: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(log) {
        Ok(text) => redaction::redact_if_enabled(text, &RedactionConfig::default()).into_bytes(),
        Err(_) => log.to_vec(),
    }
}

/// Marshal a default value to the same wire form parameter values use:
/// strings verbatim, everything else as JSON text.
fn marshal_default(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

/// Step 7: for every bundle output applicable to `action` and absent from
/// `outputs`, inject its definition's default or record a missing-output
/// error when no default exists.
fn apply_default_outputs(
    bundle: &Bundle,
    action: &str,
    outputs: &mut HashMap<String, Vec<u8>>,
    errors: &mut Vec<String>,
) {
    let Some(declared) = &bundle.outputs else {
        return;
    };

    for (name, output) in declared {
        if !output.applies_to(action) || outputs.contains_key(name) {
            continue;
        }

        let default = bundle
            .definition(&output.definition)
            .ok()
            .and_then(|def| def.default.clone());

        match default {
            Some(value) => {
                outputs.insert(name.clone(), marshal_default(&value));
            }
            None => {
                errors.push(format!("required output {name} is missing and has no default"));
            }
        }
    }
}

/// Step 9/10: record `sha256:<hex>` digests and `generatedByBundle` for
/// every captured output, then validate declared non-string outputs
/// against their definition's type.
fn finalize_outputs(
    bundle: &Bundle,
    action: &str,
    outputs: &HashMap<String, Vec<u8>>,
    claim_result: &mut ClaimResult,
    errors: &mut Vec<String>,
) {
    let declared = bundle.outputs.as_ref();

    for (name, bytes) in outputs {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = format!("sha256:{:x}", hasher.finalize());

        let output_def = declared.and_then(|d| d.get(name)).filter(|o| o.applies_to(action));
        let is_declared = output_def.is_some();

        // `apply_default_outputs` already refuses to overwrite an output present in
        // `outputs` (which includes a tee-captured RESERVED_LOGS_OUTPUT), so a bundle
        // default never collides with the reserved logs key by the time we get here.
        claim_result.outputs.insert(
            name.clone(),
            OutputMetadata {
                content_digest: digest,
                generated_by_bundle: is_declared,
            },
        );

        let Some(output) = output_def else {
            continue;
        };
        let Ok(definition) = bundle.definition(&output.definition) else {
            continue;
        };

        let is_plain_string = matches!(
            &definition.schema_type,
            Some(crate::schema::TypeSet::Single(t)) if t == "string"
        );
        if is_plain_string {
            continue;
        }

        let Ok(Some(allowed_types)) = definition.get_type() else {
            continue;
        };

        let text = String::from_utf8_lossy(bytes);
        let parsed: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => Value::String(text.to_string()),
        };

        if !allowed_types.iter().any(|t| json_type_matches(&parsed, t)) {
            errors.push(format!(
                "\"{name}\" is not any of the expected types ({}) because it is \"{}\"",
                allowed_types.join(", "),
                json_type_name(&parsed)
            ));
        }
    }
}

/// Run one bundle action end-to-end.
///
/// Returns `Err` only for a setup-time failure where the driver never
/// ran (validation, selection, assembly, or a configuration callback). A
/// driver-reported failure instead surfaces through the returned
/// `OperationResult.error` and `ClaimResult.status == Status::Failed`.
#[instrument(skip(claim, credentials, driver, callbacks), fields(installation = %claim.installation, action = %claim.action))]
pub async fn run<D: Driver>(
    claim: &Claim,
    credentials: &CredentialSet,
    driver: &mut D,
    callbacks: &[ConfigureCallback<'_>],
) -> Result<(OperationResult, ClaimResult)> {
    run_with_log_saving(claim, credentials, driver, callbacks, false).await
}

/// Same as [`run`], additionally teeing the operation's stdout/stderr into
/// a temp file and populating the reserved `io.cnab.outputs.invocationImageLogs`
/// output from it when `save_logs` is true.
#[instrument(skip(claim, credentials, driver, callbacks), fields(installation = %claim.installation, action = %claim.action))]
pub async fn run_with_log_saving<D: Driver>(
    claim: &Claim,
    credentials: &CredentialSet,
    driver: &mut D,
    callbacks: &[ConfigureCallback<'_>],
    save_logs: bool,
) -> Result<(OperationResult, ClaimResult)> {
    validate_claim(claim)?;

    let bundle = &claim.bundle;
    let stateless = action_is_stateless(bundle, &claim.action);

    let image = operation::select_invocation_image(
        bundle,
        |t| driver.handles(t),
        claim.relocation_map.as_ref(),
    )?;
    let mut op = operation::assemble(claim, image, credentials, stateless)?;

    for callback in callbacks {
        callback(&mut op)?;
    }

    let log_tee = if save_logs {
        Some(operation::install_log_tee(&mut op)?)
    } else {
        None
    };

    redaction::add_global_secrets(credentials.values().cloned());

    let mut errors: Vec<String> = Vec::new();

    let mut op_result = match driver.run(&op).await {
        Ok(result) => result,
        Err(e) => {
            errors.push(e.to_string());
            OperationResult::default()
        }
    };
    if let Some(driver_error) = &op_result.error {
        errors.push(driver_error.clone());
    }

    op_result.log = redact_log(&op_result.log);

    if let Some(tee) = log_tee {
        if !op_result.outputs.contains_key(RESERVED_LOGS_OUTPUT) {
            let tee_bytes = redact_log(&tee.into_bytes()?);
            op_result.outputs.insert(RESERVED_LOGS_OUTPUT.to_string(), tee_bytes);
        }
    }

    apply_default_outputs(bundle, &claim.action, &mut op_result.outputs, &mut errors);

    let mut claim_result = ClaimResult::new(claim.id, Status::Running, None, Utc::now());
    finalize_outputs(bundle, &claim.action, &op_result.outputs, &mut claim_result, &mut errors);

    claim_result.status = if errors.is_empty() { Status::Succeeded } else { Status::Failed };
    claim_result.message = if errors.is_empty() { None } else { Some(errors.join("; ")) };

    Ok((op_result, claim_result))
}

/// Write the initial `running` claim before the driver is invoked.
#[instrument(skip(store, claim))]
pub fn save_initial_claim(store: &ClaimStore, claim: &Claim) -> Result<()> {
    store.save_claim(claim)?;
    let pending = ClaimResult::new(claim.id, Status::Running, None, Utc::now());
    store.save_result(&claim.installation, &pending)
}

/// Write the final result and any outputs the save policy admits,
/// accumulating errors rather than stopping at the first failure.
#[instrument(skip(store, claim, claim_result, outputs))]
pub fn save_operation_result(
    store: &ClaimStore,
    claim: &Claim,
    claim_result: &ClaimResult,
    outputs: &HashMap<String, Vec<u8>>,
    policy: &OutputSavePolicy,
) -> Result<()> {
    let mut errors = Vec::new();

    if let Err(e) = store.save_result(&claim.installation, claim_result) {
        errors.push(e.to_string());
    }

    for (name, bytes) in outputs {
        if !policy.admits(name) {
            continue;
        }
        if let Err(e) = store.save_output(&claim.installation, claim_result.id, name, bytes) {
            errors.push(e.to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        warn!(errors = ?errors, "one or more claim-store writes failed");
        Err(CnabError::store(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DebugDriver;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn bundle_with_port_and_output(output_type: &str, output_default: Option<&str>) -> Bundle {
        let default_clause = match output_default {
            Some(d) => format!(r#", "default": "{d}""#),
            None => String::new(),
        };
        let json = format!(
            r#"{{
                "schemaVersion": "1.0.0",
                "name": "helloworld",
                "version": "0.1.0",
                "invocationImages": [{{"image": "example.com/helloworld:0.1.0", "imageType": "docker"}}],
                "definitions": {{
                    "port": {{"type": "integer"}},
                    "host": {{"type": "string"}},
                    "enabled": {{"type": "boolean", "default": true}},
                    "output-type": {{"type": "{output_type}"{default_clause}}},
                    "string": {{"type": "string"}}
                }},
                "parameters": {{
                    "port": {{"definition": "port", "destination": {{}}, "required": true}},
                    "host": {{"definition": "host", "destination": {{}}}}
                }},
                "outputs": {{
                    "some-output": {{"definition": "output-type", "path": "/cnab/app/outputs/some-output"}}
                }}
            }}"#
        );
        Bundle::from_json(&json).unwrap()
    }

    fn claim_for(bundle: Bundle, action: &str) -> Claim {
        let mut claim = Claim::new("wordpress", action, bundle, Utc::now());
        claim.parameters.insert("port".to_string(), serde_json::json!(8080));
        claim.parameters.insert("host".to_string(), serde_json::json!("localhost"));
        claim
    }

    #[tokio::test]
    async fn install_happy_path_with_debug_driver() {
        let bundle = bundle_with_port_and_output("string", Some("some default value"));
        let claim = claim_for(bundle, "install");
        let mut driver = DebugDriver::new();
        let credentials = CredentialSet::new();

        let (_, claim_result) = run(&claim, &credentials, &mut driver, &[]).await.unwrap();

        assert_eq!(claim_result.status, Status::Succeeded);
        assert!(claim_result.outputs.contains_key("some-output"));
    }

    #[tokio::test]
    async fn rejects_undefined_parameter_before_running_driver() {
        let bundle = bundle_with_port_and_output("string", None);
        let mut claim = claim_for(bundle, "install");
        claim.parameters.insert("param_unknown".to_string(), serde_json::json!("x"));
        let mut driver = DebugDriver::new();
        let credentials = CredentialSet::new();

        let err = run(&claim, &credentials, &mut driver, &[]).await.unwrap_err();
        assert!(err.to_string().contains("undefined parameter"));
    }

    #[tokio::test]
    async fn output_type_mismatch_is_recorded_but_digest_still_taken() {
        let bundle = bundle_with_port_and_output("boolean", None);
        let claim = claim_for(bundle, "install");
        let mut driver = FakeDriver {
            outputs: HashMap::from([("some-output".to_string(), b"2".to_vec())]),
        };
        let credentials = CredentialSet::new();

        let (_, claim_result) = run(&claim, &credentials, &mut driver, &[]).await.unwrap();

        assert_eq!(claim_result.status, Status::Failed);
        let message = claim_result.message.unwrap();
        assert!(message.contains("not any of the expected types (boolean)"));
        assert!(claim_result.outputs.contains_key("some-output"));
    }

    #[tokio::test]
    async fn missing_output_without_default_is_recorded_as_failed() {
        let bundle = bundle_with_port_and_output("string", None);
        let claim = claim_for(bundle, "install");
        let mut driver = FakeDriver { outputs: HashMap::new() };
        let credentials = CredentialSet::new();

        let (_, claim_result) = run(&claim, &credentials, &mut driver, &[]).await.unwrap();

        assert_eq!(claim_result.status, Status::Failed);
        assert!(claim_result.message.unwrap().contains("has no default"));
    }

    #[tokio::test]
    async fn default_output_is_injected_when_missing() {
        let json = r#"{
            "schemaVersion": "1.0.0",
            "name": "helloworld",
            "version": "0.1.0",
            "invocationImages": [{"image": "x", "imageType": "docker"}],
            "definitions": {
                "has-default": {"type": "string", "default": "some default1"}
            },
            "outputs": {
                "hasDefault1": {"definition": "has-default", "path": "/cnab/app/outputs/hasDefault1"}
            }
        }"#;
        let bundle = Bundle::from_json(json).unwrap();
        let claim = Claim::new("wordpress", "install", bundle, Utc::now());
        let mut driver = FakeDriver { outputs: HashMap::new() };
        let credentials = CredentialSet::new();

        let (op_result, claim_result) = run(&claim, &credentials, &mut driver, &[]).await.unwrap();

        assert_eq!(op_result.outputs.get("hasDefault1"), Some(&b"some default1".to_vec()));
        assert_eq!(claim_result.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn required_parameter_enforced_only_for_applicable_action() {
        let json = r#"{
            "schemaVersion": "1.0.0",
            "name": "b",
            "version": "0.1.0",
            "invocationImages": [{"image": "x", "imageType": "docker"}],
            "definitions": {"string": {"type": "string"}},
            "parameters": {
                "param_test": {"definition": "string", "destination": {}, "required": true, "applyTo": ["test"]}
            },
            "actions": {
                "test": {"stateless": true}
            }
        }"#;
        let bundle = Bundle::from_json(json).unwrap();
        let install_claim = Claim::new("wordpress", "install", bundle.clone(), Utc::now());
        let mut driver = DebugDriver::new();
        let credentials = CredentialSet::new();
        assert!(run(&install_claim, &credentials, &mut driver, &[]).await.is_ok());

        let test_claim = Claim::new("wordpress", "test", bundle, Utc::now());
        let err = run(&test_claim, &credentials, &mut driver, &[]).await.unwrap_err();
        assert!(err.to_string().contains("missing required parameter \"param_test\" for action \"test\""));
    }

    #[tokio::test]
    async fn callback_error_aborts_before_driver_invocation() {
        let bundle = bundle_with_port_and_output("string", None);
        let claim = claim_for(bundle, "install");
        let mut driver = NeverRunDriver;
        let credentials = CredentialSet::new();
        let reject: ConfigureCallback<'_> = &|_op| Err(CnabError::schema("callback refused"));

        let err = run(&claim, &credentials, &mut driver, &[reject]).await.unwrap_err();
        assert!(err.to_string().contains("callback refused"));
    }

    #[tokio::test]
    async fn captured_log_has_credential_values_redacted() {
        let json = r#"{
            "schemaVersion": "1.0.0",
            "name": "b",
            "version": "0.1.0",
            "invocationImages": [{"image": "x", "imageType": "docker"}],
            "credentials": {
                "db_password": {"destination": {"env": "DB_PASSWORD"}, "required": true}
            }
        }"#;
        let bundle = Bundle::from_json(json).unwrap();
        let claim = Claim::new("wordpress", "install", bundle, Utc::now());
        let mut credentials = CredentialSet::new();
        credentials.insert("db_password".to_string(), "correct-horse-battery-staple".to_string());

        let mut driver = LoggingDriver {
            log: b"connecting with password correct-horse-battery-staple".to_vec(),
        };

        let (op_result, claim_result) = run(&claim, &credentials, &mut driver, &[]).await.unwrap();

        assert_eq!(claim_result.status, Status::Succeeded);
        let log = String::from_utf8(op_result.log).unwrap();
        assert!(!log.contains("correct-horse-battery-staple"));
        assert!(log.contains("****"));
    }

    #[tokio::test]
    async fn log_saving_populates_the_reserved_logs_output() {
        let bundle = bundle_with_port_and_output("string", None);
        let claim = claim_for(bundle, "install");
        let mut driver = StdoutWritingDriver;
        let credentials = CredentialSet::new();

        let (op_result, claim_result) =
            run_with_log_saving(&claim, &credentials, &mut driver, &[], true).await.unwrap();

        let logs = op_result.outputs.get(RESERVED_LOGS_OUTPUT).expect("reserved logs output missing");
        assert_eq!(logs, b"driver stdout output\n");
        assert!(claim_result.outputs.contains_key(RESERVED_LOGS_OUTPUT));
    }

    #[tokio::test]
    async fn log_saving_disabled_by_default_leaves_reserved_output_absent() {
        let bundle = bundle_with_port_and_output("string", None);
        let claim = claim_for(bundle, "install");
        let mut driver = StdoutWritingDriver;
        let credentials = CredentialSet::new();

        let (op_result, _) = run(&claim, &credentials, &mut driver, &[]).await.unwrap();
        assert!(!op_result.outputs.contains_key(RESERVED_LOGS_OUTPUT));
    }

    #[tokio::test]
    async fn relocation_map_on_claim_is_applied_to_the_selected_image() {
        let bundle = bundle_with_port_and_output("string", Some("v"));
        let mut claim = claim_for(bundle, "install");
        let mut relocation = BTreeMap::new();
        relocation.insert(
            "example.com/helloworld:0.1.0".to_string(),
            "registry.local/helloworld:0.1.0".to_string(),
        );
        claim.relocation_map = Some(relocation);

        let mut driver = RecordingDriver { seen_image: None };
        let credentials = CredentialSet::new();

        run(&claim, &credentials, &mut driver, &[]).await.unwrap();

        assert_eq!(driver.seen_image.as_deref(), Some("registry.local/helloworld:0.1.0"));
    }

    struct StdoutWritingDriver;

    impl Driver for StdoutWritingDriver {
        fn handles(&self, _image_type: &str) -> bool {
            true
        }

        async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
            if let Some(sink) = &operation.stdout {
                sink.lock().unwrap().write_all(b"driver stdout output\n").unwrap();
            }
            Ok(OperationResult::default())
        }
    }

    struct FakeDriver {
        outputs: HashMap<String, Vec<u8>>,
    }

    impl Driver for FakeDriver {
        fn handles(&self, _image_type: &str) -> bool {
            true
        }

        async fn run(&mut self, _operation: &Operation) -> Result<OperationResult> {
            Ok(OperationResult {
                outputs: self.outputs.clone(),
                log: Vec::new(),
                error: None,
            })
        }
    }

    struct LoggingDriver {
        log: Vec<u8>,
    }

    impl Driver for LoggingDriver {
        fn handles(&self, _image_type: &str) -> bool {
            true
        }

        async fn run(&mut self, _operation: &Operation) -> Result<OperationResult> {
            Ok(OperationResult {
                outputs: HashMap::new(),
                log: self.log.clone(),
                error: None,
            })
        }
    }

    struct RecordingDriver {
        seen_image: Option<String>,
    }

    impl Driver for RecordingDriver {
        fn handles(&self, _image_type: &str) -> bool {
            true
        }

        async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
            self.seen_image = Some(operation.image.image.clone());
            Ok(OperationResult::default())
        }
    }

    struct NeverRunDriver;

    impl Driver for NeverRunDriver {
        fn handles(&self, _image_type: &str) -> bool {
            true
        }

        async fn run(&mut self, _operation: &Operation) -> Result<OperationResult> {
            panic!("driver must not run when a configuration callback fails");
        }
    }
}
