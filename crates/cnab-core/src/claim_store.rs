//! File-backed, append-only claim store.
//!
//! Layout under `root`:
//!
//! ```text
//! root/<installation>/claims/<claim_id>.json
//! root/<installation>/results/<result_id>.json
//! root/<installation>/outputs/<result_id>/<name>
//! ```
//!
//! Every write lands in a temp file next to its destination and is then
//! renamed into place, so a reader never observes a partially written
//! file. `installations()` and `claims()` walk the directory tree rather
//! than maintain a separate index, which keeps concurrent readers safe
//! against an in-flight write: `walkdir` only ever sees fully renamed
//! files.

use crate::claim::{Claim, ClaimResult};
use crate::errors::{CnabError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use ulid::Ulid;

/// A filesystem-backed claim store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ClaimStore {
    root: PathBuf,
}

impl ClaimStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn installation_dir(&self, installation: &str) -> PathBuf {
        self.root.join(installation)
    }

    fn claims_dir(&self, installation: &str) -> PathBuf {
        self.installation_dir(installation).join("claims")
    }

    fn results_dir(&self, installation: &str) -> PathBuf {
        self.installation_dir(installation).join("results")
    }

    fn outputs_dir(&self, installation: &str, result_id: Ulid) -> PathBuf {
        self.installation_dir(installation)
            .join("outputs")
            .join(result_id.to_string())
    }

    /// Write `claim` atomically. Claims are append-only: this must only be
    /// called once per claim id.
    #[instrument(skip(self, claim), fields(installation = %claim.installation, claim_id = %claim.id))]
    pub fn save_claim(&self, claim: &Claim) -> Result<()> {
        let dir = self.claims_dir(&claim.installation);
        let path = dir.join(format!("{}.json", claim.id));
        let json = serde_json::to_vec_pretty(claim)
            .map_err(|e| CnabError::store(format!("failed to serialize claim: {e}")))?;
        write_atomic(&dir, &path, &json)?;
        debug!("claim saved");
        Ok(())
    }

    /// Write `result` atomically, under the installation the referenced
    /// claim belongs to.
    #[instrument(skip(self, installation, result), fields(installation, result_id = %result.id))]
    pub fn save_result(&self, installation: &str, result: &ClaimResult) -> Result<()> {
        let dir = self.results_dir(installation);
        let path = dir.join(format!("{}.json", result.id));
        let json = serde_json::to_vec_pretty(result)
            .map_err(|e| CnabError::store(format!("failed to serialize result: {e}")))?;
        write_atomic(&dir, &path, &json)?;
        debug!("result saved");
        Ok(())
    }

    /// Write one output's raw bytes atomically.
    #[instrument(skip(self, installation, bytes), fields(installation, result_id = %result_id, name))]
    pub fn save_output(&self, installation: &str, result_id: Ulid, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.outputs_dir(installation, result_id);
        let path = dir.join(name);
        write_atomic(&dir, &path, bytes)?;
        debug!("output saved");
        Ok(())
    }

    /// List all installation names known to this store.
    pub fn installations(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// List every claim for an installation, oldest first (ULIDs sort
    /// lexicographically by creation time).
    pub fn claims(&self, installation: &str) -> Result<Vec<Claim>> {
        let dir = self.claims_dir(installation);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut claims = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| CnabError::store(format!("failed to walk claims dir: {e}")))?;
            if entry.file_type().is_file() {
                let text = fs::read_to_string(entry.path())?;
                let claim: Claim = serde_json::from_str(&text)
                    .map_err(|e| CnabError::store(format!("corrupt claim file {:?}: {e}", entry.path())))?;
                claims.push(claim);
            }
        }
        claims.sort_by_key(|c| c.id);
        Ok(claims)
    }

    /// The most recently created claim for an installation.
    pub fn latest_claim(&self, installation: &str) -> Result<Option<Claim>> {
        Ok(self.claims(installation)?.into_iter().last())
    }

    /// List every result for a claim.
    pub fn results_for_claim(&self, installation: &str, claim_id: Ulid) -> Result<Vec<ClaimResult>> {
        let dir = self.results_dir(installation);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| CnabError::store(format!("failed to walk results dir: {e}")))?;
            if entry.file_type().is_file() {
                let text = fs::read_to_string(entry.path())?;
                let result: ClaimResult = serde_json::from_str(&text)
                    .map_err(|e| CnabError::store(format!("corrupt result file {:?}: {e}", entry.path())))?;
                if result.claim_id == claim_id {
                    results.push(result);
                }
            }
        }
        results.sort_by_key(|r| r.id);
        Ok(results)
    }

    /// Read a specific output's raw bytes for a (installation, result, name) triple.
    pub fn read_output(&self, installation: &str, result_id: Ulid, name: &str) -> Result<Vec<u8>> {
        let path = self.outputs_dir(installation, result_id).join(name);
        fs::read(&path).map_err(|e| {
            CnabError::store(format!("failed to read output {name:?} for result {result_id}: {e}"))
        })
    }
}

/// Write `bytes` to `path`, via a sibling temp file then rename, so a
/// concurrent reader never observes a partial file.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CnabError::store(format!("failed to create temp file in {dir:?}: {e}")))?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| CnabError::store(format!("failed to persist {path:?}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, InvocationImage};
    use crate::claim::Status;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_bundle() -> Bundle {
        Bundle {
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
        }
    }

    #[test]
    fn save_and_read_back_claim() {
        let tmp = TempDir::new().unwrap();
        let store = ClaimStore::new(tmp.path());
        let claim = Claim::new("wordpress", "install", test_bundle(), Utc::now());
        store.save_claim(&claim).unwrap();

        let claims = store.claims("wordpress").unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, claim.id);
    }

    #[test]
    fn installation_history_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = ClaimStore::new(tmp.path());
        let first = Claim::new("wordpress", "install", test_bundle(), Utc::now());
        store.save_claim(&first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Claim::new("wordpress", "upgrade", test_bundle(), Utc::now());
        store.save_claim(&second).unwrap();

        let claims = store.claims("wordpress").unwrap();
        assert_eq!(claims[0].id, first.id);
        assert_eq!(claims[1].id, second.id);
    }

    #[test]
    fn output_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = ClaimStore::new(tmp.path());
        let claim = Claim::new("wordpress", "install", test_bundle(), Utc::now());
        store.save_claim(&claim).unwrap();
        let result = ClaimResult::new(claim.id, Status::Succeeded, None, Utc::now());
        store.save_result("wordpress", &result).unwrap();
        store.save_output("wordpress", result.id, "some-output", b"hello").unwrap();

        let bytes = store.read_output("wordpress", result.id, "some-output").unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn unknown_installation_yields_empty_history() {
        let tmp = TempDir::new().unwrap();
        let store = ClaimStore::new(tmp.path());
        assert!(store.claims("nonexistent").unwrap().is_empty());
        assert!(store.installations().unwrap().is_empty());
    }
}
