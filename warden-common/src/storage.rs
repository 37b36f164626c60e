//! Append-only JSONL journals with advisory file locking.
//!
//! Every store in Warden is a [`Journal`]: an append-only file of JSON
//! records plus a sibling `.lock` file. A transaction takes the in-process
//! mutex, then the exclusive file lock, re-reads the journal so writes from
//! other processes are visible, lets the caller decide what to append, and
//! appends. Derived index files are replaced atomically via [`atomic_write`].

use fs4::fs_std::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock, polling until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Storage(format!("Failed to open lock {}: {e}", path.display())))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(lock = %path.display(), "Lock acquisition timed out");
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "Failed to lock {}: {e}",
                        path.display()
                    )))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    if e.kind() == ErrorKind::WouldBlock {
        return true;
    }
    // ERROR_LOCK_VIOLATION
    cfg!(windows) && e.raw_os_error() == Some(33)
}

/// Replace `path` with `bytes` so readers never observe a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read every record of a JSONL file. A missing file is an empty journal.
///
/// A final line without its newline is a torn append from a crashed writer
/// and is skipped; any other undecodable line is an error.
pub fn read_jsonl<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Storage(format!(
                "Failed to open {}: {e}",
                path.display()
            )))
        }
    };

    let mut reader = BufReader::new(file);
    let mut rows = Vec::new();
    let mut line = String::new();
    let mut line_no = 0;
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let complete = line.ends_with('\n');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<R>(trimmed) {
            Ok(row) => rows.push(row),
            Err(e) if !complete => {
                tracing::warn!(
                    journal = %path.display(),
                    line = line_no,
                    error = %e,
                    "Skipping torn trailing record"
                );
            }
            Err(e) => {
                return Err(Error::CorruptRecord {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(rows)
}

/// Append records to a JSONL file in a single write.
pub fn append_jsonl<R: Serialize>(path: &Path, rows: &[R]) -> Result<()> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Storage(format!("Failed to open {}: {e}", path.display())))?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

/// Append-only record journal, file-backed or in memory.
#[derive(Debug)]
pub struct Journal<R> {
    path: Option<PathBuf>,
    rows: Mutex<Vec<R>>,
    lock_timeout: Duration,
}

impl<R> Journal<R>
where
    R: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) a file-backed journal.
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        Ok(Self {
            path: Some(path),
            rows: Mutex::new(Vec::new()),
            lock_timeout,
        })
    }

    /// A journal that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rows: Mutex::new(Vec::new()),
            lock_timeout: Duration::ZERO,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Consistent snapshot of every record.
    pub fn snapshot(&self) -> Result<Vec<R>> {
        self.transact(|rows| Ok::<_, Error>((rows.to_vec(), Vec::new())))
    }

    /// Run a read-decide-append transaction.
    ///
    /// `decide` sees every record and returns its result plus the records to
    /// append. Nothing is appended when it returns an error.
    pub fn transact<T, E>(
        &self,
        decide: impl FnOnce(&[R]) -> std::result::Result<(T, Vec<R>), E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        self.transact_then(decide, |_| Ok(()))
    }

    /// Like [`Journal::transact`], then runs `commit` over the full journal
    /// while the lock is still held. Used to rewrite derived indexes.
    pub fn transact_then<T, E>(
        &self,
        decide: impl FnOnce(&[R]) -> std::result::Result<(T, Vec<R>), E>,
        commit: impl FnOnce(&[R]) -> Result<()>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);

        let _file_lock = match &self.path {
            Some(path) => {
                let lock = FileLock::acquire(&Self::lock_path(path), self.lock_timeout)?;
                *rows = read_jsonl(path)?;
                Some(lock)
            }
            None => None,
        };

        let (out, appended) = decide(&rows)?;
        if appended.is_empty() {
            return Ok(out);
        }

        if let Some(path) = &self.path {
            append_jsonl(path, &appended)?;
        }
        rows.extend(appended);
        commit(&rows)?;
        Ok(out)
    }
}
