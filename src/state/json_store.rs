//! A single JSON document owned by exactly one writer process.
//!
//! Opening takes an exclusive advisory lock on a sibling `.lock` file that
//! is held for the lifetime of the store; a second process pointed at the
//! same path fails to open instead of racing the first one.

use crate::error::{GatewayError, GatewayResult};
use crate::state::{quarantine, write_atomic};
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct JsonStore<T> {
    path: PathBuf,
    _lock: File,
    current: Mutex<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    /// Lock and load the document at `path`, starting from `T::default()`
    /// when it does not exist yet.
    ///
    /// A document that fails to parse is moved aside and replaced with the
    /// default so a corrupt file never blocks startup.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }

        let lock = acquire_lock(&path.with_extension("lock"))?;

        let doc = match read_document::<T>(path)? {
            Some(Ok(doc)) => doc,
            Some(Err(err)) => {
                let moved = quarantine(path).with_context(|| {
                    format!("Failed to quarantine corrupt state {}", path.display())
                })?;
                error!(
                    "State document {} is corrupt ({}); moved to {}",
                    path.display(),
                    err,
                    moved.display()
                );
                T::default()
            }
            None => {
                info!("No state at {}, starting fresh", path.display());
                T::default()
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
            current: Mutex::new(doc),
        })
    }

    /// Read a document without taking the writer lock (read-only tooling).
    pub fn read_snapshot(path: &Path) -> Result<T> {
        match read_document::<T>(path)? {
            Some(doc) => doc.with_context(|| format!("Failed to parse {}", path.display())),
            None => Ok(T::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone of the committed document.
    pub async fn snapshot(&self) -> T {
        self.current.lock().await.clone()
    }

    /// Non-blocking snapshot; `None` while a writer holds the document.
    pub fn try_snapshot(&self) -> Option<T> {
        self.current.try_lock().ok().map(|doc| doc.clone())
    }

    /// Apply `f` to a copy of the document, persist the copy, then commit it.
    ///
    /// If `f` fails or the write fails, the in-memory document is left
    /// untouched, so memory never runs ahead of disk.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut T) -> GatewayResult<R>,
    ) -> GatewayResult<R> {
        let mut current = self.current.lock().await;
        let mut next = current.clone();
        let result = f(&mut next)?;
        self.persist(&next).await?;
        *current = next;
        Ok(result)
    }

    /// Apply `f` in memory first, then try to persist.
    ///
    /// Used for bookkeeping that must never be lost even when the disk is
    /// failing (error counters): a write failure is returned but the change
    /// stays in memory and rides along with the next successful write.
    pub async fn update_in_place(&self, f: impl FnOnce(&mut T)) -> GatewayResult<()> {
        let mut current = self.current.lock().await;
        f(&mut current);
        let doc = current.clone();
        self.persist(&doc).await
    }

    async fn persist(&self, doc: &T) -> GatewayResult<()> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(GatewayError::persistence)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(GatewayError::persistence)?
            .map_err(|err| {
                warn!("Failed to write {}: {}", self.path.display(), err);
                GatewayError::persistence(format!("{}: {}", self.path.display(), err))
            })
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<serde_json::Result<T>>> {
    match std::fs::read(path) {
        Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(data) => Ok(Some(serde_json::from_slice(&data))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn acquire_lock(lock_path: &Path) -> Result<File> {
    let mut lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("Failed to open state lock {}", lock_path.display()))?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            bail!(
                "state is already owned by another process (lock: {})",
                lock_path.display()
            );
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to lock {}", lock_path.display()));
        }
    }

    lock_file
        .set_len(0)
        .with_context(|| format!("Failed to truncate state lock {}", lock_path.display()))?;
    writeln!(&mut lock_file, "{}", std::process::id())
        .with_context(|| format!("Failed to write state lock {}", lock_path.display()))?;

    Ok(lock_file)
}
