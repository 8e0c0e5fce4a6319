//! Operation assembly: turning a validated claim into a driver-ready
//! `Operation` — parameter/credential injection, bundle/claim/image-map
//! attachment, reserved environment variables, and invocation-image
//! selection.

use crate::bundle::{Bundle, InvocationImage};
use crate::canonical_json;
use crate::claim::Claim;
use crate::credential::CredentialSet;
use crate::errors::{CnabError, Result};
use crate::parameter::Parameter;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// A writable sink an operation's stdout/stderr is copied into.
pub type Sink = Arc<Mutex<dyn Write + Send>>;

/// A `Write` adapter that duplicates everything written to it into a
/// shared temp-file handle, then forwards the same bytes to an optional
/// wrapped sink. Used to populate the reserved invocation-image-logs
/// output without touching the caller's own sink in place.
struct TeeWriter {
    inner: Option<Sink>,
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            file.write_all(buf)?;
        }
        if let Some(inner) = &self.inner {
            let mut inner = inner.lock().expect("sink lock poisoned");
            inner.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        if let Some(inner) = &self.inner {
            inner.lock().expect("sink lock poisoned").flush()?;
        }
        Ok(())
    }
}

/// A log tee installed on an operation's stdout/stderr sinks, backed by a
/// single temp file both are interleaved into.
pub struct LogTee {
    file: Arc<Mutex<std::fs::File>>,
    _temp: tempfile::NamedTempFile,
}

/// Interpose a tee into `operation`'s stdout/stderr: both are replaced
/// with writers that copy every write into a shared temp file before
/// forwarding to whatever sink was previously installed (which may be
/// `None`). Call [`LogTee::into_bytes`] after the driver returns to read
/// back everything captured.
pub fn install_log_tee(operation: &mut Operation) -> Result<LogTee> {
    let temp = tempfile::NamedTempFile::new()
        .map_err(|e| CnabError::driver(format!("failed to create log tee temp file: {e}")))?;
    let file = temp
        .reopen()
        .map_err(|e| CnabError::driver(format!("failed to reopen log tee temp file: {e}")))?;
    let file = Arc::new(Mutex::new(file));

    operation.stdout = Some(Arc::new(Mutex::new(TeeWriter {
        inner: operation.stdout.take(),
        file: file.clone(),
    })));
    operation.stderr = Some(Arc::new(Mutex::new(TeeWriter {
        inner: operation.stderr.take(),
        file: file.clone(),
    })));

    Ok(LogTee { file, _temp: temp })
}

impl LogTee {
    /// Read back everything written through the tee so far.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = self
            .file
            .lock()
            .map_err(|_| CnabError::driver("log tee file lock poisoned"))?;
        file.flush().map_err(|e| CnabError::driver(format!("failed to flush log tee file: {e}")))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| CnabError::driver(format!("failed to seek log tee file: {e}")))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| CnabError::driver(format!("failed to read log tee file: {e}")))?;
        Ok(bytes)
    }
}

/// A single image reference resolved for this operation (the selected
/// invocation image, relocated if the claim carries a relocation map).
#[derive(Debug, Clone)]
pub struct OperationImage {
    pub image_type: String,
    pub image: String,
    pub content_digest: Option<String>,
}

/// The fully resolved, driver-ready description of one bundle action.
#[derive(Clone)]
pub struct Operation {
    pub installation_name: String,
    pub revision: String,
    pub action: String,
    pub parameters: BTreeMap<String, Value>,
    pub image: OperationImage,
    pub environment: HashMap<String, String>,
    pub files: HashMap<String, Vec<u8>>,
    /// absolute-path-in-container → output name
    pub outputs: HashMap<String, String>,
    pub bundle: Bundle,
    pub stdout: Option<Sink>,
    pub stderr: Option<Sink>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("installation_name", &self.installation_name)
            .field("revision", &self.revision)
            .field("action", &self.action)
            .field("image", &self.image)
            .field("environment", &self.environment)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Inject resolved parameters into `env`/`files` per each parameter's
/// destination.
///
/// String-valued parameters are transferred verbatim — their JSON
/// representation is unwrapped back to a raw string rather than kept
/// JSON-quoted — so escape sequences in user-authored string parameters
/// survive a round trip; non-string types are transferred as their JSON
/// text form.
pub fn inject_parameters(
    bundle: &Bundle,
    values: &BTreeMap<String, Value>,
    action: &str,
    env: &mut HashMap<String, String>,
    files: &mut HashMap<String, Vec<u8>>,
) -> Result<()> {
    let declared = bundle.parameters.as_ref();

    for name in values.keys() {
        let known = declared.map(|p| p.contains_key(name)).unwrap_or(false);
        if !known {
            return Err(CnabError::parameter(format!("undefined parameter \"{name}\"")));
        }
    }

    let Some(parameters) = declared else {
        return Ok(());
    };

    for (name, param) in parameters {
        if !param.applies_to(action) {
            continue;
        }

        let Some(value) = values.get(name) else {
            if param.is_required() {
                return Err(CnabError::parameter(format!(
                    "missing required parameter \"{name}\" for action \"{action}\""
                )));
            }
            continue;
        };

        let text = marshal_parameter_value(value)?;
        place_destination(name, param, &text, env, files);
    }

    Ok(())
}

/// Marshal a parameter value to its wire text form: strings are
/// transferred verbatim (the JSON string content, unescaped), everything
/// else as its JSON text.
fn marshal_parameter_value(value: &Value) -> Result<String> {
    let json = serde_json::to_string(value)
        .map_err(|e| CnabError::parameter(format!("failed to marshal parameter value: {e}")))?;
    if json.starts_with('"') {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Ok(json),
        }
    } else {
        Ok(json)
    }
}

fn place_destination(
    name: &str,
    param: &Parameter,
    text: &str,
    env: &mut HashMap<String, String>,
    files: &mut HashMap<String, Vec<u8>>,
) {
    let mut placed = false;
    if let Some(path) = &param.destination.path {
        files.insert(path.clone(), text.as_bytes().to_vec());
        placed = true;
    }
    if let Some(env_name) = &param.destination.env {
        env.insert(env_name.clone(), text.to_string());
        placed = true;
    }
    if !placed {
        env.insert(Parameter::default_env_var(name), text.to_string());
    }
}

/// Expand credentials applicable to `action` into `env`/`files`.
/// `stateless` actions never require credentials even if declared
/// required.
pub fn expand_credentials(
    bundle: &Bundle,
    supplied: &CredentialSet,
    stateless: bool,
    action: &str,
    env: &mut HashMap<String, String>,
    files: &mut HashMap<String, Vec<u8>>,
) -> Result<()> {
    let Some(credentials) = &bundle.credentials else {
        return Ok(());
    };

    for (name, cred) in credentials {
        if !cred.applies_to(action) {
            continue;
        }

        match supplied.get(name) {
            Some(value) => {
                if let Some(env_name) = &cred.destination.env {
                    env.insert(env_name.clone(), value.clone());
                }
                if let Some(path) = &cred.destination.path {
                    files.insert(path.clone(), value.as_bytes().to_vec());
                }
            }
            None => {
                if cred.is_required() && !stateless {
                    return Err(CnabError::credential(format!(
                        "credential {name} is missing from the user-supplied credentials"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Select the first invocation image whose type a driver's `handles`
/// predicate accepts, applying any relocation map on the claim.
pub fn select_invocation_image<'a>(
    bundle: &'a Bundle,
    handles: impl Fn(&str) -> bool,
    relocation_map: Option<&BTreeMap<String, String>>,
) -> Result<OperationImage> {
    if bundle.invocation_images.is_empty() {
        return Err(CnabError::schema("no invocationImages are defined"));
    }

    let selected: &InvocationImage = bundle
        .invocation_images
        .iter()
        .find(|img| handles(img.image_type_or_default()))
        .ok_or_else(|| {
            CnabError::driver("driver is not compatible with any of the invocation images in the bundle")
        })?;

    let mut image_ref = selected.image.clone();
    if let Some(map) = relocation_map {
        if let Some(remapped) = map.get(&selected.image) {
            image_ref = remapped.clone();
        }
    }

    Ok(OperationImage {
        image_type: selected.image_type_or_default().to_string(),
        image: image_ref,
        content_digest: selected.content_digest.clone(),
    })
}

/// Assemble a driver-ready `Operation` from a validated claim.
///
/// 1. Reject supplied parameters the bundle doesn't declare.
/// 2. Inject parameters (§ [`inject_parameters`]).
/// 3. Inject credentials (§ [`expand_credentials`]).
/// 4. Attach canonical-JSON bundle/claim and the content-image map.
/// 5. Populate the always-defined reserved environment variables.
/// 6. Build the outputs map restricted to outputs admitting this action.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    claim: &Claim,
    image: OperationImage,
    credentials: &CredentialSet,
    stateless: bool,
) -> Result<Operation> {
    let bundle = &claim.bundle;

    let mut env = HashMap::new();
    let mut files = HashMap::new();

    inject_parameters(bundle, &claim.parameters, &claim.action, &mut env, &mut files)?;
    expand_credentials(bundle, credentials, stateless, &claim.action, &mut env, &mut files)?;

    files.insert(
        "/cnab/bundle.json".to_string(),
        bundle.to_canonical_json()?.into_bytes(),
    );
    files.insert(
        "/cnab/claim.json".to_string(),
        canonical_json::to_canonical_string(claim)?.into_bytes(),
    );

    let image_map: BTreeMap<&String, &crate::bundle::Image> = bundle
        .images
        .as_ref()
        .map(|m| m.iter().collect())
        .unwrap_or_default();
    files.insert(
        "/cnab/app/image-map.json".to_string(),
        canonical_json::to_canonical_string(&image_map)?.into_bytes(),
    );

    env.insert("CNAB_ACTION".to_string(), claim.action.clone());
    env.insert("CNAB_INSTALLATION_NAME".to_string(), claim.installation.clone());
    env.insert("CNAB_BUNDLE_NAME".to_string(), bundle.name.clone());
    env.insert("CNAB_BUNDLE_VERSION".to_string(), bundle.version.clone());
    env.insert("CNAB_REVISION".to_string(), claim.revision.to_string());
    env.insert("CNAB_CLAIMS_VERSION".to_string(), claim.schema_version.clone());

    let outputs = bundle
        .outputs
        .as_ref()
        .map(|outputs| {
            outputs
                .iter()
                .filter(|(_, o)| o.applies_to(&claim.action))
                .filter_map(|(name, o)| o.path.clone().map(|path| (path, name.clone())))
                .collect()
        })
        .unwrap_or_default();

    Ok(Operation {
        installation_name: claim.installation.clone(),
        revision: claim.revision.to_string(),
        action: claim.action.clone(),
        parameters: claim.parameters.clone(),
        image,
        environment: env,
        files,
        outputs,
        bundle: bundle.clone(),
        stdout: None,
        stderr: None,
    })
}
