//! Active agent sessions, persisted as one `sessions.json` document.
//!
//! Mutations are serialized: each one is applied to a copy of the set,
//! the copy is written, and only then does it replace the in-memory map.
//! A failed write leaves both memory and disk at the previous state.

use crate::error::{GatewayError, GatewayResult};
use crate::state::{quarantine, write_atomic};
use crate::types::Session;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const SESSIONS_FILE: &str = "sessions.json";

type SessionMap = HashMap<String, Session>;

pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<SessionMap>,
    max_messages: AtomicU32,
    /// Held from staging a change until it is committed.
    writer: Mutex<()>,
}

impl SessionStore {
    /// Load persisted sessions from `state_dir`.
    ///
    /// Records that fail to parse, and repeated ids, are skipped with a
    /// warning. A file that is not a JSON array at all is moved aside.
    pub fn open(state_dir: &Path, max_messages: u32) -> anyhow::Result<Self> {
        let path = state_dir.join(SESSIONS_FILE);
        let sessions = load_records(&path)?;
        if !sessions.is_empty() {
            info!("Restored {} session(s) from {}", sessions.len(), path.display());
        }
        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
            max_messages: AtomicU32::new(max_messages),
            writer: Mutex::new(()),
        })
    }

    /// Message allowance given to sessions created from now on.
    pub fn set_max_messages(&self, max_messages: u32) {
        self.max_messages.store(max_messages, Ordering::Relaxed);
    }

    pub async fn create(&self) -> GatewayResult<Session> {
        let now = Utc::now();
        let session = Session {
            id: new_session_id(),
            created_at: now,
            last_active_at: now,
            message_count: 0,
            max_messages: self.max_messages.load(Ordering::Relaxed),
        };

        self.mutate(|sessions| {
            sessions.insert(session.id.clone(), session.clone());
            Ok(((), true))
        })
        .await?;
        debug!("Session {} created", session.id);
        Ok(session)
    }

    pub fn get(&self, id: &str) -> GatewayResult<Session> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    /// Count one turn on `id`.
    ///
    /// Fails with `NotFound` if the session was terminated concurrently and
    /// with `SessionExhausted` once `max_messages` is reached.
    pub async fn touch(&self, id: &str) -> GatewayResult<Session> {
        self.mutate(|sessions| {
            let session = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
            if session.is_exhausted() {
                return Err(GatewayError::SessionExhausted(id.to_string()));
            }
            session.message_count += 1;
            session.last_active_at = Utc::now();
            Ok((session.clone(), true))
        })
        .await
    }

    /// Remove `id`. Returns whether it was present; terminating an unknown
    /// or already terminated session is not an error.
    pub async fn terminate(&self, id: &str) -> GatewayResult<bool> {
        let removed = self
            .mutate(|sessions| {
                let removed = sessions.remove(id).is_some();
                Ok((removed, removed))
            })
            .await?;
        if removed {
            info!("Session {} terminated", id);
        }
        Ok(removed)
    }

    /// Copy of every active session, oldest first.
    pub fn list(&self) -> Vec<Session> {
        sorted(&self.read()).into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate sessions idle longer than `timeout`; returns their ids.
    pub async fn evict_idle(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> GatewayResult<Vec<String>> {
        let evicted = self
            .mutate(|sessions| {
                let evicted: Vec<String> = sessions
                    .values()
                    .filter(|s| s.idle_for(now) > timeout)
                    .map(|s| s.id.clone())
                    .collect();
                for id in &evicted {
                    sessions.remove(id);
                }
                let changed = !evicted.is_empty();
                Ok((evicted, changed))
            })
            .await?;
        if !evicted.is_empty() {
            info!("Evicted {} idle session(s)", evicted.len());
        }
        Ok(evicted)
    }

    /// Apply `f` to a copy of the set and, when it reports a change, write
    /// the copy before committing it.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut SessionMap) -> GatewayResult<(R, bool)>,
    ) -> GatewayResult<R> {
        let _writer = self.writer.lock().await;
        let mut next = self.read().clone();
        let (result, changed) = f(&mut next)?;
        if changed {
            self.persist(&next).await?;
            *self.write() = next;
        }
        Ok(result)
    }

    async fn persist(&self, sessions: &SessionMap) -> GatewayResult<()> {
        let bytes = serde_json::to_vec_pretty(&sorted(sessions)).map_err(GatewayError::persistence)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(GatewayError::persistence)?
            .map_err(|err| {
                warn!("Failed to write {}: {}", self.path.display(), err);
                GatewayError::persistence(format!("{}: {}", self.path.display(), err))
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted(sessions: &SessionMap) -> Vec<&Session> {
    let mut records: Vec<&Session> = sessions.values().collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

fn not_found(id: &str) -> GatewayError {
    GatewayError::NotFound(format!("session '{id}'"))
}

/// Random 128-bit id, hex encoded.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn load_records(path: &Path) -> anyhow::Result<SessionMap> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(anyhow::Error::new(err).context(format!("Failed to read {}", path.display()))),
    };

    let records: Vec<serde_json::Value> = match serde_json::from_slice(&data) {
        Ok(records) => records,
        Err(err) => {
            let moved = quarantine(path)
                .with_context(|| format!("Failed to quarantine corrupt {}", path.display()))?;
            error!(
                "Session file {} unreadable ({}); moved to {}, starting empty",
                path.display(),
                err,
                moved.display()
            );
            return Ok(HashMap::new());
        }
    };

    let mut seen = HashSet::new();
    let mut sessions = HashMap::new();
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<Session>(record) {
            Ok(session) if seen.insert(session.id.clone()) => {
                sessions.insert(session.id.clone(), session);
            }
            Ok(session) => warn!("Skipping duplicate session record {}", session.id),
            Err(err) => warn!("Skipping corrupt session record #{}: {}", index, err),
        }
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn concurrent_creates_yield_distinct_ids() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(temp.path(), 10).unwrap());

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create().await.unwrap().id })
            })
            .collect();
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }

        assert_eq!(ids.len(), 100);
        assert_eq!(store.list().len(), 100);

        let reopened = SessionStore::open(temp.path(), 10).unwrap();
        assert_eq!(reopened.len(), 100);
    }

    #[tokio::test]
    async fn terminate_twice_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path(), 10).unwrap();
        let keep = store.create().await.unwrap();
        let gone = store.create().await.unwrap();

        assert!(store.terminate(&gone.id).await.unwrap());
        assert!(!store.terminate(&gone.id).await.unwrap());
        assert_eq!(store.list(), vec![keep]);
        assert!(matches!(store.get(&gone.id), Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn touch_counts_turns_until_exhausted() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path(), 2).unwrap();
        let session = store.create().await.unwrap();

        assert_eq!(store.touch(&session.id).await.unwrap().message_count, 1);
        assert_eq!(store.touch(&session.id).await.unwrap().message_count, 2);
        assert!(matches!(
            store.touch(&session.id).await,
            Err(GatewayError::SessionExhausted(_))
        ));

        store.terminate(&session.id).await.unwrap();
        assert!(matches!(
            store.touch(&session.id).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped_on_load() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        let good = Session {
            id: "a1".into(),
            created_at: now,
            last_active_at: now,
            message_count: 3,
            max_messages: 10,
        };
        let file = serde_json::json!([
            good,
            { "id": "broken" },
            good,
        ]);
        std::fs::write(temp.path().join(SESSIONS_FILE), file.to_string()).unwrap();

        let store = SessionStore::open(temp.path(), 10).unwrap();
        assert_eq!(store.list(), vec![good]);
    }

    #[tokio::test]
    async fn unreadable_file_is_moved_aside() {
        let temp = TempDir::new().unwrap();
        let original = br#"[{"id":"a1","createdAt":"#;
        std::fs::write(temp.path().join(SESSIONS_FILE), original).unwrap();

        let store = SessionStore::open(temp.path(), 10).unwrap();
        assert!(store.is_empty());
        store.create().await.unwrap();

        let moved: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(std::fs::read(moved[0].path()).unwrap(), original.to_vec());
    }

    #[tokio::test]
    async fn failed_write_leaves_sessions_unchanged() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path(), 10).unwrap();
        let session = store.create().await.unwrap();

        // A directory where the temp file goes makes every write fail.
        let tmp = temp.path().join(format!("{SESSIONS_FILE}.tmp"));
        std::fs::create_dir(&tmp).unwrap();

        assert!(matches!(
            store.terminate(&session.id).await,
            Err(GatewayError::Persistence(_))
        ));
        assert!(store.get(&session.id).is_ok());
        assert!(matches!(store.create().await, Err(GatewayError::Persistence(_))));
        assert!(matches!(store.touch(&session.id).await, Err(GatewayError::Persistence(_))));
        assert_eq!(store.list(), vec![session.clone()]);

        std::fs::remove_dir(&tmp).unwrap();
        assert!(store.terminate(&session.id).await.unwrap());
        let reopened = SessionStore::open(temp.path(), 10).unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path(), 10).unwrap();
        let idle = store.create().await.unwrap();

        let later = Utc::now() + Duration::hours(2);
        let evicted = store.evict_idle(later, Duration::hours(1)).await.unwrap();
        assert_eq!(evicted, vec![idle.id]);
        assert!(store.is_empty());

        let reopened = SessionStore::open(temp.path(), 10).unwrap();
        assert!(reopened.is_empty());
    }
}
