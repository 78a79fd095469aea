//! Package metadata and integrity manifest.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::Error;

/// Current package layout version.
pub const PACKAGE_VERSION: u32 = 1;

/// File name of the metadata document inside a package.
pub const METADATA_FILE: &str = "metadata.json";

/// Suffix of compressed package files.
pub const PACKAGE_SUFFIX: &str = ".dockertree-package.tar.gz";

/// Hint recorded at export time about the expected import mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeHint {
    /// Import into an existing project as a new worktree.
    Normal,
    /// Self-contained: code included, importable anywhere.
    Standalone,
}

/// `metadata.json` contents. Checksums cover every payload file, keyed by
/// package-relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Package layout version.
    pub package_version: u32,
    /// Version of the tool that produced the package.
    pub tool_version: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Branch the package was exported from.
    pub branch_name: String,
    /// Project the package belongs to.
    pub project_name: String,
    /// HEAD commit of the exported branch.
    pub git_commit: String,
    /// Whether a code archive is included.
    pub include_code: bool,
    /// Declared volumes included under `volumes/`.
    pub volumes: Vec<String>,
    /// SHA-256 of every payload file, keyed by relative path.
    pub checksums: BTreeMap<String, String>,
    /// Expected import mode.
    pub mode_hint: ModeHint,
}

impl PackageMetadata {
    /// Load metadata from an extracted package directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] when the document is missing or
    /// corrupt.
    pub fn load(package_dir: &Path) -> Result<Self, Error> {
        let path = package_dir.join(METADATA_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            Error::integrity(format!("package is missing {METADATA_FILE}"))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::integrity(format!("corrupt {METADATA_FILE}: {e}")))
    }

    /// Write metadata into a package directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on filesystem failure.
    pub fn store(&self, package_dir: &Path) -> Result<(), Error> {
        let path = package_dir.join(METADATA_FILE);
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::integrity(format!("failed to serialize metadata: {e}")))?;
        std::fs::write(&path, raw)
            .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
    }

    /// Verify every checksum against the extracted payload. Runs before
    /// any import side effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] on the first mismatch or missing file.
    pub fn verify(&self, package_dir: &Path) -> Result<(), Error> {
        for (relative, expected) in &self.checksums {
            let path = package_dir.join(relative);
            if !path.is_file() {
                return Err(Error::integrity(format!(
                    "package payload missing: {relative}"
                )));
            }
            checksum::verify_sha256(&path, expected)?;
        }
        Ok(())
    }
}

/// Compute checksums for every file under `package_dir` except the
/// metadata document itself.
///
/// # Errors
///
/// Returns [`Error::Io`] on filesystem failure.
pub fn collect_checksums(package_dir: &Path) -> Result<BTreeMap<String, String>, Error> {
    let mut checksums = BTreeMap::new();
    collect_into(package_dir, package_dir, &mut checksums)?;
    Ok(checksums)
}

fn collect_into(
    root: &Path,
    dir: &Path,
    out: &mut BTreeMap<String, String>,
) -> Result<(), Error> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::io(format!("failed to read {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("failed to read directory entry", e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_into(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| Error::integrity("payload path escapes the package"))?
                .to_string_lossy()
                .replace('\\', "/");
            if relative == METADATA_FILE {
                continue;
            }
            out.insert(relative, checksum::file_sha256(&path)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata(checksums: BTreeMap<String, String>) -> PackageMetadata {
        PackageMetadata {
            package_version: PACKAGE_VERSION,
            tool_version: "0.9.0".to_string(),
            created_at: Utc::now(),
            branch_name: "feature-auth".to_string(),
            project_name: "myapp".to_string(),
            git_commit: "a".repeat(40),
            include_code: false,
            volumes: vec!["postgres_data".to_string()],
            checksums,
            mode_hint: ModeHint::Normal,
        }
    }

    #[test]
    fn roundtrips_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("volumes")).unwrap();
        std::fs::write(dir.path().join("volumes/postgres_data.tar.gz"), b"blob").unwrap();

        let checksums = collect_checksums(dir.path()).unwrap();
        assert_eq!(checksums.len(), 1);
        let metadata = sample_metadata(checksums);
        metadata.store(dir.path()).unwrap();

        let loaded = PackageMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded.branch_name, "feature-auth");
        loaded.verify(dir.path()).unwrap();
    }

    #[test]
    fn single_byte_flip_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.bin"), b"payload").unwrap();
        let metadata = sample_metadata(collect_checksums(dir.path()).unwrap());
        metadata.store(dir.path()).unwrap();

        std::fs::write(dir.path().join("payload.bin"), b"paYload").unwrap();
        let err = PackageMetadata::load(dir.path())
            .unwrap()
            .verify(dir.path())
            .unwrap_err();
        assert_eq!(err.code(), "integrity_error");
    }

    #[test]
    fn missing_payload_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.bin"), b"payload").unwrap();
        let metadata = sample_metadata(collect_checksums(dir.path()).unwrap());
        metadata.store(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join("payload.bin")).unwrap();

        let err = PackageMetadata::load(dir.path())
            .unwrap()
            .verify(dir.path())
            .unwrap_err();
        assert_eq!(err.code(), "integrity_error");
    }

    #[test]
    fn metadata_is_excluded_from_checksums() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.bin"), b"x").unwrap();
        sample_metadata(collect_checksums(dir.path()).unwrap())
            .store(dir.path())
            .unwrap();
        let again = collect_checksums(dir.path()).unwrap();
        assert!(!again.contains_key(METADATA_FILE));
        assert_eq!(again.len(), 1);
    }
}
