//! Safe cloning, backup, and restore of named volumes.
//!
//! Two copy policies exist. `FastCopy` moves the file tree through a
//! throwaway container and is correct whenever nothing is writing to the
//! source. Database volumes with a live producer take `LiveSnapshot`: a
//! logical dump against the running instance, replayed into a fresh data
//! directory, because file-copying a running database yields a torn copy.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::config::ProjectConfig;
use crate::error::Error;
use crate::runtime::{timeouts, DockerRuntime};

/// How a volume was (or will be) copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPolicy {
    /// File-level copy through a throwaway container.
    FastCopy,
    /// Logical database dump and replay.
    LiveSnapshot,
}

/// Clones and archives named volumes through the runtime adapter.
#[derive(Debug)]
pub struct VolumeCloner<'a> {
    runtime: &'a DockerRuntime,
    config: &'a ProjectConfig,
}

impl<'a> VolumeCloner<'a> {
    /// Create a cloner for a project.
    #[must_use]
    pub const fn new(runtime: &'a DockerRuntime, config: &'a ProjectConfig) -> Self {
        Self { runtime, config }
    }

    /// Decide the policy for copying `src` when it backs the declared
    /// volume `declared`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the runtime cannot be queried.
    pub fn policy_for(&self, declared: &str, src: &str) -> Result<CopyPolicy, Error> {
        if !self.config.requires_live_snapshot(declared) {
            return Ok(CopyPolicy::FastCopy);
        }
        let users = self.runtime.containers_using_volume(src)?;
        if users.iter().any(crate::runtime::ContainerInfo::is_running) {
            Ok(CopyPolicy::LiveSnapshot)
        } else {
            Ok(CopyPolicy::FastCopy)
        }
    }

    /// Copy `src` into a new volume `dst`, dispatching on the policy rules.
    ///
    /// A missing source produces a fresh empty destination so newly
    /// initialized projects work without seed data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeCopy`] when the copy fails; the destination
    /// volume is removed before returning.
    pub fn copy(&self, declared: &str, src: &str, dst: &str) -> Result<CopyPolicy, Error> {
        self.runtime.volume_create(dst)?;

        if !self.runtime.volume_exists(src)? {
            tracing::warn!(source = src, "source volume missing, created empty destination");
            return Ok(CopyPolicy::FastCopy);
        }

        let policy = self.policy_for(declared, src)?;
        let result = match policy {
            CopyPolicy::FastCopy => self.fast_copy(src, dst),
            CopyPolicy::LiveSnapshot => self.live_snapshot(src, dst),
        };
        if let Err(err) = result {
            // Never leave a half-written destination behind.
            if let Err(cleanup) = self.runtime.volume_remove(dst) {
                tracing::warn!(volume = dst, error = %cleanup, "failed to remove partial volume");
            }
            return Err(Error::volume_copy(dst, err.to_string()));
        }
        Ok(policy)
    }

    fn fast_copy(&self, src: &str, dst: &str) -> Result<(), Error> {
        tracing::info!(source = src, dest = dst, "copying volume");
        self.runtime
            .run_throwaway(
                "alpine",
                &[format!("{src}:/source:ro"), format!("{dst}:/dest")],
                &["sh", "-c", "cp -a /source/. /dest/"],
                timeouts::VOLUME_COPY,
            )
            .map(|_| ())
    }

    /// Dump the live database and replay it into the destination volume.
    fn live_snapshot(&self, src: &str, dst: &str) -> Result<(), Error> {
        let users = self.runtime.containers_using_volume(src)?;
        let producer = users
            .iter()
            .find(|c| c.is_running())
            .ok_or_else(|| Error::precondition("live snapshot requested without a running producer"))?;

        tracing::info!(
            source = src,
            container = %producer.name,
            "source database is live, taking consistent snapshot"
        );

        let user = self
            .config
            .environment
            .get("POSTGRES_USER")
            .map_or("postgres", String::as_str);

        let dump = self.runtime.exec_capture(
            &producer.name,
            &["pg_dumpall", "-U", user, "--clean"],
            timeouts::LIVE_SNAPSHOT,
        )?;

        let staging = tempfile::tempdir()
            .map_err(|e| Error::io("failed to create snapshot staging directory", e))?;
        let dump_path = staging.path().join("dump.sql");
        let mut file = std::fs::File::create(&dump_path)
            .map_err(|e| Error::io(format!("failed to create {}", dump_path.display()), e))?;
        file.write_all(dump.as_bytes())
            .map_err(|e| Error::io("failed to write database dump", e))?;
        drop(file);

        // Replay with the producer's own image so catalog versions match.
        // The container starts as root; cluster operations must run as the
        // postgres user.
        let script = "set -e\n\
             chown -R postgres:postgres /var/lib/postgresql/data\n\
             cp /backup/dump.sql /tmp/dump.sql\n\
             chown postgres /tmp/dump.sql\n\
             su postgres -s /bin/sh -c 'initdb -D /var/lib/postgresql/data >/dev/null'\n\
             su postgres -s /bin/sh -c \"pg_ctl -D /var/lib/postgresql/data -o '-c listen_addresses=' -w start >/dev/null\"\n\
             su postgres -s /bin/sh -c 'psql -U postgres -d postgres -f /tmp/dump.sql >/dev/null'\n\
             su postgres -s /bin/sh -c 'pg_ctl -D /var/lib/postgresql/data -m fast -w stop >/dev/null'"
            .to_string();
        self.runtime.run_throwaway(
            &producer.image,
            &[
                format!("{dst}:/var/lib/postgresql/data"),
                format!("{}:/backup:ro", staging.path().display()),
            ],
            &["sh", "-c", &script],
            timeouts::LIVE_SNAPSHOT,
        )?;
        Ok(())
    }

    /// Archive a volume into `<out_dir>/<volume>.tar.gz`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the backup container fails.
    pub fn backup(&self, volume: &str, out_dir: &Path) -> Result<std::path::PathBuf, Error> {
        std::fs::create_dir_all(out_dir)
            .map_err(|e| Error::io(format!("failed to create {}", out_dir.display()), e))?;
        let archive = format!("{volume}.tar.gz");
        tracing::info!(volume, "backing up volume");
        self.runtime.run_throwaway(
            "alpine",
            &[
                format!("{volume}:/data:ro"),
                format!("{}:/backup", out_dir.display()),
            ],
            &["tar", "czf", &format!("/backup/{archive}"), "-C", "/data", "."],
            timeouts::VOLUME_COPY,
        )?;
        Ok(out_dir.join(archive))
    }

    /// Restore a volume from a `.tar.gz` archive, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the archive is missing and
    /// [`Error::Runtime`] when the restore container fails.
    pub fn restore(&self, volume: &str, archive: &Path) -> Result<(), Error> {
        if !archive.is_file() {
            return Err(Error::not_found(format!(
                "volume archive {}",
                archive.display()
            )));
        }
        let dir = archive
            .parent()
            .ok_or_else(|| Error::validation("archive path has no parent directory"))?;
        let name = archive
            .file_name()
            .ok_or_else(|| Error::validation("archive path has no file name"))?
            .to_string_lossy();
        self.runtime.volume_create(volume)?;
        tracing::info!(volume, "restoring volume");
        self.runtime.run_throwaway(
            "alpine",
            &[
                format!("{volume}:/data"),
                format!("{}:/backup:ro", dir.display()),
            ],
            &["tar", "xzf", &format!("/backup/{name}"), "-C", "/data"],
            timeouts::VOLUME_COPY,
        )?;
        Ok(())
    }

    /// Remove all branch-scoped volumes for a stack. Best-effort: failures
    /// are collected, not short-circuited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] naming the volumes that could not be
    /// removed.
    pub fn remove_stack_volumes(&self, stack_name: &str) -> Result<Vec<String>, Error> {
        let prefix = format!("{stack_name}_");
        let volumes = self.runtime.volume_list(&prefix)?;
        let mut removed = Vec::new();
        let mut failed = Vec::new();
        for volume in volumes {
            match self.runtime.volume_remove(&volume) {
                Ok(()) => removed.push(volume),
                Err(err) => {
                    tracing::warn!(volume = %volume, error = %err, "failed to remove volume");
                    failed.push(volume);
                },
            }
        }
        if failed.is_empty() {
            Ok(removed)
        } else {
            Err(Error::Runtime {
                tool: "docker".to_string(),
                exit_code: None,
                stderr: format!("volumes not removed: {}", failed.join(", ")),
            })
        }
    }

    /// Timeout that applies to copying this declared volume.
    #[must_use]
    pub fn copy_timeout(&self, declared: &str) -> Duration {
        if self.config.requires_live_snapshot(declared) {
            timeouts::LIVE_SNAPSHOT
        } else {
            timeouts::VOLUME_COPY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_timeouts_extend_for_databases() {
        let config = ProjectConfig::new("myapp");
        let runtime = DockerRuntime::with_compose_style(crate::runtime::ComposeStyle::Plugin);
        let cloner = VolumeCloner::new(&runtime, &config);
        assert_eq!(cloner.copy_timeout("postgres_data"), timeouts::LIVE_SNAPSHOT);
        assert_eq!(cloner.copy_timeout("media_files"), timeouts::VOLUME_COPY);
    }
}
