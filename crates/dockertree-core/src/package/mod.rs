//! Export and import of worktree packages.
//!
//! A package bundles a worktree's environment, its named volumes, and
//! optionally a code archive, under a SHA-256 manifest:
//!
//! ```text
//! <pkg>.dockertree-package.tar.gz
//! ├── metadata.json
//! ├── environment/
//! │   ├── .env                  (optional)
//! │   ├── .dockertree/
//! │   └── env.dockertree
//! ├── volumes/<V>.tar.gz
//! └── code/<B>.tar              (iff include_code)
//! ```
//!
//! Import verifies every checksum before the first side effect.

pub mod manifest;

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::envgen::{self, EnvFile};
use crate::error::Error;
use crate::orchestrator::WorktreeOrchestrator;
use crate::paths::{copy_dockertree_dir, ProjectContext};
use crate::vcs::GitAdapter;
use crate::volumes::VolumeCloner;

pub use manifest::{ModeHint, PackageMetadata, METADATA_FILE, PACKAGE_SUFFIX, PACKAGE_VERSION};

/// Options for `packages export`.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Include a `git archive` of the branch.
    pub include_code: bool,
    /// Output directory; defaults to the project root.
    pub output_dir: Option<PathBuf>,
    /// Skip volume archives (environment-only package).
    pub skip_volumes: bool,
}

/// Options for `packages import`.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Target branch; defaults to the packaged branch name.
    pub target_branch: Option<String>,
    /// Restore volume data.
    pub restore_data: bool,
    /// Force standalone mode; `None` auto-detects.
    pub standalone: Option<bool>,
    /// Extraction target for standalone imports.
    pub target_dir: Option<PathBuf>,
    /// Domain override (TLS on). Mutually exclusive with `ip`.
    pub domain: Option<String>,
    /// IP override (TLS off). Mutually exclusive with `domain`.
    pub ip: Option<String>,
}

/// Result of an export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    /// Path of the produced package.
    pub package_path: PathBuf,
    /// Branch that was exported.
    pub branch: String,
    /// Volumes included.
    pub volumes: Vec<String>,
    /// Whether code is included.
    pub include_code: bool,
}

/// Result of an import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    /// Branch the package was imported as.
    pub branch: String,
    /// Where the environment landed.
    pub path: PathBuf,
    /// Whether standalone mode was used.
    pub standalone: bool,
    /// Volumes restored.
    pub volumes_restored: Vec<String>,
}

/// One entry of `packages list`.
#[derive(Debug, Clone, Serialize)]
pub struct PackageListEntry {
    /// Package file path.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Branch recorded in the metadata, when readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Creation time recorded in the metadata, when readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<Utc>>,
}

/// Exports and imports worktree packages.
pub struct PackageManager<'a> {
    orchestrator: &'a WorktreeOrchestrator,
}

impl<'a> PackageManager<'a> {
    /// Build a package manager over an orchestrator.
    #[must_use]
    pub const fn new(orchestrator: &'a WorktreeOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Export a worktree into a compressed package.
    ///
    /// A running worktree is stopped for the duration of the export and
    /// restarted afterwards so volume archives are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the worktree does not exist, and
    /// the failing step's error otherwise.
    pub fn export(&self, branch: &str, options: &ExportOptions) -> Result<ExportReport, Error> {
        let status = self.orchestrator.status(branch)?;

        let was_running = status.state == crate::orchestrator::WorktreeState::Running;
        if was_running {
            tracing::info!(branch, "stopping worktree for a consistent export");
            self.orchestrator.stop(branch)?;
        }

        let result = self.export_stopped(branch, &status.path, options);

        if was_running {
            if let Err(err) = self.orchestrator.start(branch, true) {
                tracing::warn!(branch, error = %err, "failed to restart worktree after export");
            }
        }

        result
    }

    fn export_stopped(
        &self,
        branch: &str,
        worktree_path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport, Error> {
        let config = self.orchestrator.config();
        let git = self.orchestrator.git();

        let staging = tempfile::tempdir()
            .map_err(|e| Error::io("failed to create export staging directory", e))?;
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let bundle_name = format!("{}-{}-{timestamp}.dockertree-package", config.slug(), branch);
        let bundle = staging.path().join(&bundle_name);

        // environment/: fractal config, env file, optional project .env.
        let environment = bundle.join("environment");
        std::fs::create_dir_all(&environment)
            .map_err(|e| Error::io("failed to create package environment directory", e))?;
        copy_dockertree_dir(worktree_path, &environment)?;
        let env_source = ProjectContext::env_file_path(worktree_path);
        if env_source.is_file() {
            std::fs::copy(&env_source, environment.join(crate::config::ENV_FILE_NAME))
                .map_err(|e| Error::io("failed to copy env.dockertree into package", e))?;
        }
        let dotenv = worktree_path.join(".env");
        if dotenv.is_file() {
            std::fs::copy(&dotenv, environment.join(".env"))
                .map_err(|e| Error::io("failed to copy .env into package", e))?;
        }

        // volumes/: one archive per declared volume.
        let mut volumes = Vec::new();
        if !options.skip_volumes {
            let cloner = VolumeCloner::new(self.orchestrator.runtime(), config);
            let volume_dir = bundle.join("volumes");
            for declared in &config.volumes {
                let volume = config.volume_name(branch, declared);
                if !self.orchestrator.runtime().volume_exists(&volume)? {
                    tracing::warn!(volume = %volume, "volume missing, skipping backup");
                    continue;
                }
                cloner.backup(&volume, &volume_dir)?;
                // Archive is keyed by the declared name for portability.
                std::fs::rename(
                    volume_dir.join(format!("{volume}.tar.gz")),
                    volume_dir.join(format!("{declared}.tar.gz")),
                )
                .map_err(|e| Error::io("failed to finalize volume archive", e))?;
                volumes.push(declared.clone());
            }
        }

        // code/: reproducible archive of the branch tree.
        if options.include_code {
            git.archive(branch, &bundle.join("code").join(format!("{branch}.tar")))?;
        }

        let metadata = PackageMetadata {
            package_version: PACKAGE_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            branch_name: branch.to_string(),
            project_name: config.project_name.clone(),
            git_commit: git.rev_parse(branch).unwrap_or_default(),
            include_code: options.include_code,
            volumes: volumes.clone(),
            checksums: manifest::collect_checksums(&bundle)?,
            mode_hint: if options.include_code {
                ModeHint::Standalone
            } else {
                ModeHint::Normal
            },
        };
        metadata.store(&bundle)?;

        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.orchestrator.context().outer_root.clone());
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| Error::io(format!("failed to create {}", output_dir.display()), e))?;
        let package_path = output_dir.join(format!("{bundle_name}.tar.gz"));
        compress_dir(&bundle, &bundle_name, &package_path)?;

        tracing::info!(package = %package_path.display(), "package exported");
        Ok(ExportReport {
            package_path,
            branch: branch.to_string(),
            volumes,
            include_code: options.include_code,
        })
    }

    /// Validate a package: layout, metadata, and every checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] when anything fails verification.
    pub fn validate(&self, package_path: &Path) -> Result<PackageMetadata, Error> {
        let (_staging, package_dir) = extract_package(package_path)?;
        let metadata = PackageMetadata::load(&package_dir)?;
        metadata.verify(&package_dir)?;
        Ok(metadata)
    }

    /// Import a package, auto-detecting normal vs standalone mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for conflicting overrides,
    /// [`Error::Integrity`] for manifest failures (before any side
    /// effect), and the failing step's error otherwise.
    pub fn import(&self, package_path: &Path, options: &ImportOptions) -> Result<ImportReport, Error> {
        if options.domain.is_some() && options.ip.is_some() {
            return Err(Error::validation(
                "--domain and --ip are mutually exclusive",
            ));
        }

        let (_staging, package_dir) = extract_package(package_path)?;
        let metadata = PackageMetadata::load(&package_dir)?;
        metadata.verify(&package_dir)?;

        let standalone = options.standalone.unwrap_or_else(|| {
            let ctx = self.orchestrator.context();
            let in_project = crate::config::ProjectConfig::path(&ctx.outer_root).is_file()
                && GitAdapter::is_repo_root(&ctx.outer_root);
            !in_project
        });

        if standalone {
            standalone_import(
                self.orchestrator.runtime(),
                &package_dir,
                &metadata,
                options,
            )
        } else {
            self.normal_import(&package_dir, &metadata, options)
        }
    }

    fn normal_import(
        &self,
        package_dir: &Path,
        metadata: &PackageMetadata,
        options: &ImportOptions,
    ) -> Result<ImportReport, Error> {
        let config = self.orchestrator.config();
        let git = self.orchestrator.git();
        let branch = options
            .target_branch
            .clone()
            .unwrap_or_else(|| metadata.branch_name.clone());
        crate::validate::validate_branch_name(&branch)?;

        if git.find_worktree(&branch)?.is_some() {
            return Err(Error::already_exists(format!(
                "worktree for branch '{branch}'"
            )));
        }

        let path = self
            .orchestrator
            .context()
            .worktree_path(&config.worktree_dir, &branch);
        git.worktree_add(&branch, &path)?;

        // The packaged .dockertree wins over the project's copy.
        copy_dockertree_dir(&package_dir.join("environment"), &path)?;

        let packaged_env = package_dir.join("environment").join(crate::config::ENV_FILE_NAME);
        let mut env = if packaged_env.is_file() {
            EnvFile::load(&packaged_env)?
        } else {
            EnvFile::default()
        };
        if branch != metadata.branch_name {
            let stack = config.stack_name(&branch);
            let domain = format!("{stack}.localhost");
            env.set("COMPOSE_PROJECT_NAME", &stack);
            env.set("SITE_DOMAIN", format!("http://{domain}"));
            env.set(
                "ALLOWED_HOSTS",
                format!("localhost,127.0.0.1,{domain},*.localhost"),
            );
            env.set("VITE_ALLOWED_HOSTS", envgen::vite_allowed_hosts(&domain));
        }
        env.set("PROJECT_ROOT", path.to_string_lossy());
        apply_overrides(&mut env, options);
        env.store(&ProjectContext::env_file_path(&path))?;

        let packaged_dotenv = package_dir.join("environment").join(".env");
        if packaged_dotenv.is_file() {
            std::fs::copy(&packaged_dotenv, path.join(".env"))
                .map_err(|e| Error::io("failed to restore .env", e))?;
        }

        let mut volumes_restored = Vec::new();
        if options.restore_data {
            let cloner = VolumeCloner::new(self.orchestrator.runtime(), config);
            for declared in &metadata.volumes {
                let archive = package_dir.join("volumes").join(format!("{declared}.tar.gz"));
                let volume = config.volume_name(&branch, declared);
                cloner.restore(&volume, &archive)?;
                volumes_restored.push(volume);
            }
        }

        if metadata.include_code {
            let code = package_dir.join("code").join(format!("{}.tar", metadata.branch_name));
            if code.is_file() {
                extract_tar(&code, &path)?;
            }
        }

        tracing::info!(branch = %branch, "package imported as worktree");
        Ok(ImportReport {
            branch,
            path,
            standalone: false,
            volumes_restored,
        })
    }

}

/// Import a package into a fresh directory without an existing project.
///
/// This is the project-less entry point the remote import uses on a bare
/// server: only a runtime is required.
///
/// # Errors
///
/// Returns [`Error::PreconditionFailed`] when the package lacks code,
/// [`Error::Integrity`] on manifest failure, and the failing step's error
/// otherwise.
pub fn import_standalone(
    runtime: &crate::runtime::DockerRuntime,
    package_path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, Error> {
    if options.domain.is_some() && options.ip.is_some() {
        return Err(Error::validation(
            "--domain and --ip are mutually exclusive",
        ));
    }
    let (_staging, package_dir) = extract_package(package_path)?;
    let metadata = PackageMetadata::load(&package_dir)?;
    metadata.verify(&package_dir)?;
    standalone_import(runtime, &package_dir, &metadata, options)
}

/// Build a complete project from a code-bearing package: fresh repository,
/// initial commit, embedded `.dockertree/`, a worktree for the packaged
/// branch, and restored volumes.
fn standalone_import(
    runtime: &crate::runtime::DockerRuntime,
    package_dir: &Path,
    metadata: &PackageMetadata,
    options: &ImportOptions,
) -> Result<ImportReport, Error> {
    if !metadata.include_code {
        return Err(Error::precondition(
            "standalone import requires a package exported with --include-code",
        ));
    }
    let target = options.target_dir.clone().ok_or_else(|| {
        Error::validation("standalone import requires --target-dir")
    })?;
    if target.exists() && target.read_dir().is_ok_and(|mut d| d.next().is_some()) {
        return Err(Error::already_exists(format!(
            "target directory {} is not empty",
            target.display()
        )));
    }
    std::fs::create_dir_all(&target)
        .map_err(|e| Error::io(format!("failed to create {}", target.display()), e))?;

    // Code tree plus the packaged configuration become the project root.
    let code = package_dir
        .join("code")
        .join(format!("{}.tar", metadata.branch_name));
    extract_tar(&code, &target)?;
    copy_dockertree_dir(&package_dir.join("environment"), &target)?;

    let packaged_dotenv = package_dir.join("environment").join(".env");
    if packaged_dotenv.is_file() {
        std::fs::copy(&packaged_dotenv, target.join(".env"))
            .map_err(|e| Error::io("failed to restore .env", e))?;
    }

    // A repository is needed so the branch can get its own worktree.
    let git = GitAdapter::new(&target);
    git.init_with_commit(&format!(
        "Initial import from package: {}",
        metadata.branch_name
    ))?;

    let config = crate::config::ProjectConfig::load(&target)
        .unwrap_or_else(|_| crate::config::ProjectConfig::new(&metadata.project_name));

    let branch = metadata.branch_name.clone();
    let worktree_path = target.join(&config.worktree_dir).join(&branch);
    git.worktree_add(&branch, &worktree_path)?;
    copy_dockertree_dir(&target, &worktree_path)?;

    let packaged_env = package_dir.join("environment").join(crate::config::ENV_FILE_NAME);
    let mut env = if packaged_env.is_file() {
        EnvFile::load(&packaged_env)?
    } else {
        EnvFile::default()
    };
    env.set("PROJECT_ROOT", worktree_path.to_string_lossy());
    apply_overrides(&mut env, options);
    env.store(&ProjectContext::env_file_path(&worktree_path))?;
    if packaged_dotenv.is_file() {
        std::fs::copy(&packaged_dotenv, worktree_path.join(".env"))
            .map_err(|e| Error::io("failed to restore worktree .env", e))?;
    }

    let mut volumes_restored = Vec::new();
    if options.restore_data {
        let cloner = VolumeCloner::new(runtime, &config);
        let stack = crate::config::stack_name(&metadata.project_name, &branch);
        for declared in &metadata.volumes {
            let archive = package_dir.join("volumes").join(format!("{declared}.tar.gz"));
            let volume = format!("{stack}_{declared}");
            cloner.restore(&volume, &archive)?;
            volumes_restored.push(volume);
        }
    }

    tracing::info!(target = %target.display(), "package imported standalone");
    Ok(ImportReport {
        branch,
        path: target,
        standalone: true,
        volumes_restored,
    })
}

fn apply_overrides(env: &mut EnvFile, options: &ImportOptions) {
    if let Some(domain) = &options.domain {
        envgen::apply_domain_override(env, domain);
    } else if let Some(ip) = &options.ip {
        envgen::apply_ip_override(env, ip);
    }
}

/// List packages in a directory, newest first.
///
/// # Errors
///
/// Returns [`Error::Io`] when the directory cannot be read.
pub fn list_packages(dir: &Path) -> Result<Vec<PackageListEntry>, Error> {
    let mut entries = Vec::new();
    let read = std::fs::read_dir(dir)
        .map_err(|e| Error::io(format!("failed to read {}", dir.display()), e))?;
    for entry in read {
        let entry = entry.map_err(|e| Error::io("failed to read directory entry", e))?;
        let path = entry.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !name.ends_with(PACKAGE_SUFFIX) {
            continue;
        }
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let metadata = peek_metadata(&path).ok();
        entries.push(PackageListEntry {
            path,
            size_bytes,
            branch: metadata.as_ref().map(|m| m.branch_name.clone()),
            created_at: metadata.as_ref().map(|m| m.created_at),
        });
    }
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(entries)
}

/// Read only `metadata.json` out of a compressed package.
///
/// # Errors
///
/// Returns [`Error::Integrity`] when the archive has no metadata.
pub fn peek_metadata(package_path: &Path) -> Result<PackageMetadata, Error> {
    let file = File::open(package_path)
        .map_err(|e| Error::io(format!("failed to open {}", package_path.display()), e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| Error::integrity(format!("unreadable package archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::integrity(format!("truncated package archive: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::integrity(format!("corrupt archive path: {e}")))?;
        if path.file_name().is_some_and(|n| n == METADATA_FILE) {
            let mut raw = String::new();
            std::io::Read::read_to_string(&mut entry, &mut raw)
                .map_err(|e| Error::integrity(format!("truncated metadata: {e}")))?;
            return serde_json::from_str(&raw)
                .map_err(|e| Error::integrity(format!("corrupt metadata: {e}")));
        }
    }
    Err(Error::integrity("package has no metadata.json"))
}

/// Compress a bundle directory into `dest`, rooted at `bundle_name`.
fn compress_dir(bundle: &Path, bundle_name: &str, dest: &Path) -> Result<(), Error> {
    let file = File::create(dest)
        .map_err(|e| Error::io(format!("failed to create {}", dest.display()), e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(bundle_name, bundle)
        .map_err(|e| Error::io("failed to archive package", e))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(|e| Error::io("failed to finalize package archive", e))?;
    Ok(())
}

/// Extract a package to a staging directory and locate the bundle root.
fn extract_package(package_path: &Path) -> Result<(tempfile::TempDir, PathBuf), Error> {
    if !package_path.is_file() {
        return Err(Error::not_found(format!(
            "package file {}",
            package_path.display()
        )));
    }
    let staging = tempfile::tempdir()
        .map_err(|e| Error::io("failed to create import staging directory", e))?;
    let file = File::open(package_path)
        .map_err(|e| Error::io(format!("failed to open {}", package_path.display()), e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(staging.path())
        .map_err(|e| Error::integrity(format!("failed to extract package: {e}")))?;

    let bundle = std::fs::read_dir(staging.path())
        .map_err(|e| Error::io("failed to scan extracted package", e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| {
            p.is_dir()
                && p.file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(".dockertree-package"))
        })
        .ok_or_else(|| Error::integrity("archive does not contain a package directory"))?;
    Ok((staging, bundle))
}

/// Extract a plain tar archive into a directory.
fn extract_tar(archive_path: &Path, dest: &Path) -> Result<(), Error> {
    let file = File::open(archive_path)
        .map_err(|e| Error::io(format!("failed to open {}", archive_path.display()), e))?;
    let mut archive = tar::Archive::new(file);
    archive
        .unpack(dest)
        .map_err(|e| Error::integrity(format!("failed to extract code archive: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_and_peek_roundtrip() {
        let staging = tempfile::tempdir().unwrap();
        let bundle = staging.path().join("demo.dockertree-package");
        std::fs::create_dir_all(bundle.join("environment")).unwrap();
        std::fs::write(bundle.join("environment/env.dockertree"), "A=1\n").unwrap();
        let metadata = PackageMetadata {
            package_version: PACKAGE_VERSION,
            tool_version: "0.9.0".into(),
            created_at: Utc::now(),
            branch_name: "feature-auth".into(),
            project_name: "myapp".into(),
            git_commit: String::new(),
            include_code: false,
            volumes: vec![],
            checksums: manifest::collect_checksums(&bundle).unwrap(),
            mode_hint: ModeHint::Normal,
        };
        metadata.store(&bundle).unwrap();

        let out = staging.path().join("demo.dockertree-package.tar.gz");
        compress_dir(&bundle, "demo.dockertree-package", &out).unwrap();

        let peeked = peek_metadata(&out).unwrap();
        assert_eq!(peeked.branch_name, "feature-auth");

        let (_keep, extracted) = extract_package(&out).unwrap();
        let loaded = PackageMetadata::load(&extracted).unwrap();
        loaded.verify(&extracted).unwrap();
    }

    #[test]
    fn tampered_package_fails_before_side_effects() {
        let staging = tempfile::tempdir().unwrap();
        let bundle = staging.path().join("demo.dockertree-package");
        std::fs::create_dir_all(bundle.join("volumes")).unwrap();
        std::fs::write(bundle.join("volumes/postgres_data.tar.gz"), b"data").unwrap();
        let metadata = PackageMetadata {
            package_version: PACKAGE_VERSION,
            tool_version: "0.9.0".into(),
            created_at: Utc::now(),
            branch_name: "feature-auth".into(),
            project_name: "myapp".into(),
            git_commit: String::new(),
            include_code: false,
            volumes: vec!["postgres_data".into()],
            checksums: manifest::collect_checksums(&bundle).unwrap(),
            mode_hint: ModeHint::Normal,
        };
        metadata.store(&bundle).unwrap();
        // Flip one byte after the manifest was computed.
        std::fs::write(bundle.join("volumes/postgres_data.tar.gz"), b"dAta").unwrap();
        let out = staging.path().join("demo.dockertree-package.tar.gz");
        compress_dir(&bundle, "demo.dockertree-package", &out).unwrap();

        let (_keep, extracted) = extract_package(&out).unwrap();
        let err = PackageMetadata::load(&extracted)
            .unwrap()
            .verify(&extracted)
            .unwrap_err();
        assert_eq!(err.code(), "integrity_error");
    }

    #[test]
    fn list_filters_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.dockertree-package.tar.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.tar.gz"), b"x").unwrap();
        let entries = list_packages(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
