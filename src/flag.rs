// ABOUTME: Process-exclusive operation flag per environment.
// ABOUTME: Advisory file lock plus an exclusive-create metadata file for humans.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("another operation is in progress for environment '{environment}'")]
    Contention { environment: String },

    #[error("flag I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Operator-facing record written into the flag file. Nothing in the core
/// parses it back; it exists so a human can diagnose a stuck flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    pub environment: String,

    /// Hostname of the machine holding the flag.
    pub holder: String,

    /// Process ID of the holder.
    pub pid: u32,

    pub acquired_at: DateTime<Utc>,
}

impl FlagMetadata {
    /// Capture metadata for the current process, picking up CI identifiers
    /// from the environment when present.
    pub fn capture(environment: &str) -> Self {
        Self {
            pipeline_id: std::env::var("CI_PIPELINE_ID").ok(),
            commit_ref: std::env::var("CI_COMMIT_REF_NAME").ok(),
            project_name: std::env::var("CI_PROJECT_NAME").ok(),
            environment: environment.to_string(),
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// A held environment flag. The advisory lock lives on `<env>.flag.lock`;
/// the metadata file at `<env>.flag` makes the lock visible to operators.
///
/// Holding the flag means BOTH: the lock is held and the flag file exists
/// with our metadata. Acquisition is atomic across the two (the lock is
/// released if the file cannot be created); release is tolerant (the file
/// is removed even if unlocking errors, and vice versa).
pub struct Flag {
    environment: String,
    flag_path: PathBuf,
    lock_file: Option<File>,
    released: bool,
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flag")
            .field("environment", &self.environment)
            .field("flag_path", &self.flag_path)
            .field("released", &self.released)
            .finish()
    }
}

impl Flag {
    /// Path of the flag file for an environment under a state directory.
    pub fn flag_path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir.join(format!("{environment}.flag"))
    }

    fn lock_path(flag_path: &Path) -> PathBuf {
        let mut s = flag_path.as_os_str().to_owned();
        s.push(".lock");
        PathBuf::from(s)
    }

    /// Default per-user state directory, e.g. `~/.local/state/anabasis`.
    pub fn default_state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("anabasis")
    }

    /// Acquire the flag for an environment. Fails fast on contention.
    pub fn acquire(state_dir: &Path, environment: &str) -> Result<Self, FlagError> {
        std::fs::create_dir_all(state_dir).map_err(|e| FlagError::Io {
            path: state_dir.to_path_buf(),
            source: e,
        })?;

        let flag_path = Self::flag_path(state_dir, environment);
        let lock_path = Self::lock_path(&flag_path);

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| FlagError::Io {
                path: lock_path.clone(),
                source: e,
            })?;

        if let Err(e) = lock_file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(FlagError::Contention {
                    environment: environment.to_string(),
                });
            }
            return Err(FlagError::Io {
                path: lock_path,
                source: e,
            });
        }

        let metadata = FlagMetadata::capture(environment);
        // Exclusive create: a leftover flag file from a crashed run means a
        // human has to look before we plough on.
        let create_result = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&flag_path);

        let mut flag_file = match create_result {
            Ok(file) => file,
            Err(e) => {
                let _ = fs2::FileExt::unlock(&lock_file);
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    return Err(FlagError::Contention {
                        environment: environment.to_string(),
                    });
                }
                return Err(FlagError::Io {
                    path: flag_path,
                    source: e,
                });
            }
        };

        let body = serde_json::to_string_pretty(&metadata).expect("flag metadata serializes");
        if let Err(e) = flag_file.write_all(body.as_bytes()) {
            let _ = fs2::FileExt::unlock(&lock_file);
            let _ = std::fs::remove_file(&flag_path);
            return Err(FlagError::Io {
                path: flag_path,
                source: e,
            });
        }

        tracing::debug!(environment, path = %flag_path.display(), "flag acquired");

        Ok(Self {
            environment: environment.to_string(),
            flag_path,
            lock_file: Some(lock_file),
            released: false,
        })
    }

    /// Release the flag: remove the file and drop the lock. Both halves are
    /// attempted regardless of the other's outcome.
    pub fn release(mut self) -> Result<(), FlagError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), FlagError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let remove_result = match std::fs::remove_file(&self.flag_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };

        let unlock_result = match self.lock_file.take() {
            Some(file) => fs2::FileExt::unlock(&file),
            None => Ok(()),
        };

        tracing::debug!(environment = %self.environment, "flag released");

        if let Err(e) = remove_result {
            return Err(FlagError::Io {
                path: self.flag_path.clone(),
                source: e,
            });
        }
        if let Err(e) = unlock_result {
            return Err(FlagError::Io {
                path: Self::lock_path(&self.flag_path),
                source: e,
            });
        }
        Ok(())
    }
}

impl Drop for Flag {
    // Flag release must happen on every exit path, including unwinds the
    // controller never sees.
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release_inner() {
                tracing::warn!(error = %e, "failed to release flag on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_metadata_and_release_removes_it() {
        let dir = TempDir::new().unwrap();
        let flag = Flag::acquire(dir.path(), "staging").unwrap();

        let flag_path = Flag::flag_path(dir.path(), "staging");
        let body = std::fs::read_to_string(&flag_path).unwrap();
        let metadata: FlagMetadata = serde_json::from_str(&body).unwrap();
        assert_eq!(metadata.environment, "staging");
        assert_eq!(metadata.pid, std::process::id());
        assert!(!metadata.holder.is_empty());

        flag.release().unwrap();
        assert!(!flag_path.exists());
    }

    #[test]
    fn second_acquire_reports_contention() {
        let dir = TempDir::new().unwrap();
        let _held = Flag::acquire(dir.path(), "staging").unwrap();

        let err = Flag::acquire(dir.path(), "staging").unwrap_err();
        assert!(matches!(err, FlagError::Contention { .. }));
    }

    #[test]
    fn different_environments_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let _a = Flag::acquire(dir.path(), "staging").unwrap();
        let b = Flag::acquire(dir.path(), "production");
        assert!(b.is_ok());
    }

    #[test]
    fn drop_releases_the_flag() {
        let dir = TempDir::new().unwrap();
        {
            let _flag = Flag::acquire(dir.path(), "staging").unwrap();
        }
        // Dropped without an explicit release; a new acquire must succeed.
        let again = Flag::acquire(dir.path(), "staging");
        assert!(again.is_ok());
    }

    #[test]
    fn leftover_flag_file_blocks_acquisition() {
        let dir = TempDir::new().unwrap();
        let flag_path = Flag::flag_path(dir.path(), "staging");
        std::fs::write(&flag_path, "{}").unwrap();

        let err = Flag::acquire(dir.path(), "staging").unwrap_err();
        assert!(matches!(err, FlagError::Contention { .. }));
    }
}
