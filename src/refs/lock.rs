//! Exclusive lock files with commit-by-rename.
//!
//! A lock is `<target>.lock` created with create-new semantics. The holder
//! writes the replacement content into the lock file, fsyncs, and commits
//! by renaming over the target; any other outcome unlinks the lock. The
//! guard removes the lock on drop if neither `commit` nor `rollback` ran,
//! so an error path cannot strand a lock.
//!
//! Acquisition retries a bounded number of times with linearly growing
//! backoff; a live contender therefore stalls us briefly, a crashed one
//! (stale lock) fails the acquisition for the caller to resolve.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Attempts before giving up on a held lock.
const MAX_ATTEMPTS: u32 = 16;
/// Base backoff; attempt `n` sleeps `n * BACKOFF_STEP`, capped.
const BACKOFF_STEP: Duration = Duration::from_millis(5);
/// Longest single backoff sleep.
const BACKOFF_CAP: Duration = Duration::from_millis(50);

/// Outcome of a lock acquisition attempt.
#[derive(Debug)]
pub enum LockError {
    /// Lock file exists and stayed present through every retry.
    Contended,
    /// Filesystem error while creating the lock.
    Io(io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contended => write!(f, "lock held by another process"),
            Self::Io(err) => write!(f, "lock I/O error: {err}"),
        }
    }
}

impl std::error::Error for LockError {}

/// An acquired lock over `target`.
#[derive(Debug)]
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    done: bool,
}

impl LockFile {
    /// Acquires `<target>.lock`, retrying with bounded backoff.
    ///
    /// Parent directories of the target are created on demand.
    pub fn acquire(target: &Path) -> Result<Self, LockError> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(LockError::Io)?;
        }

        for attempt in 0..MAX_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(file) => {
                    return Ok(Self {
                        target: target.to_owned(),
                        lock_path,
                        file: Some(file),
                        done: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let backoff = BACKOFF_STEP.saturating_mul(attempt + 1).min(BACKOFF_CAP);
                    thread::sleep(backoff);
                }
                Err(err) => return Err(LockError::Io(err)),
            }
        }
        Err(LockError::Contended)
    }

    /// Writes replacement content into the lock file.
    pub fn write_content(&mut self, content: &[u8]) -> io::Result<()> {
        let file = self.file.as_mut().expect("lock file open");
        file.write_all(content)
    }

    /// Fsyncs and renames the lock over the target.
    pub fn commit(mut self) -> io::Result<()> {
        let file = self.file.take().expect("lock file open");
        file.sync_all()?;
        drop(file);
        let result = fs::rename(&self.lock_path, &self.target);
        if result.is_err() {
            let _ = fs::remove_file(&self.lock_path);
        }
        self.done = true;
        result
    }

    /// Unlinks the lock without touching the target.
    pub fn rollback(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.lock_path);
        self.done = true;
    }

    /// The path this lock protects.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// `<target>.lock`, preserving the full file name.
fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}
