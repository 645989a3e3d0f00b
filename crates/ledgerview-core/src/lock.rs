use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Lock errors for the migration file lock and the per-tenant projection row lock.
#[derive(Debug)]
pub enum LockError {
    /// The advisory lock file beside the projection database stayed locked.
    Timeout { path: PathBuf, waited: Duration },
    /// Another worker holds the `(projection, instance)` row lock.
    Held {
        projection: String,
        instance_id: String,
        holder: String,
        waited: Duration,
    },
    /// The row lock expired or was taken over before the batch committed.
    Lost {
        projection: String,
        instance_id: String,
    },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } | Self::Held { .. } | Self::Lost { .. } => {
                ErrorCode::LockContention
            }
            Self::IoError(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => {
                write!(
                    f,
                    "{}: lock timed out after {:?} at {}",
                    self.code().code(),
                    waited,
                    path.display()
                )
            }
            Self::Held {
                projection,
                instance_id,
                holder,
                waited,
            } => write!(
                f,
                "{}: {projection}/{instance_id} locked by {holder} (waited {waited:?})",
                self.code().code(),
            ),
            Self::Lost {
                projection,
                instance_id,
            } => write!(
                f,
                "{}: lock on {projection}/{instance_id} lost before commit",
                self.code().code(),
            ),
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

/// RAII guard for the exclusive advisory lock taken while projection
/// migrations and schema checks run against a file-backed database.
#[derive(Debug)]
pub struct InitLock {
    file: File,
    path: PathBuf,
}

impl InitLock {
    /// Lock file used for a given database path (`<db>.init.lock`).
    #[must_use]
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".init.lock");
        db_path.with_file_name(name)
    }

    /// Acquire the exclusive lock, polling until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent")
        })?;
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            if file.try_lock_exclusive().is_ok() {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {
        drop(self);
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InitLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
