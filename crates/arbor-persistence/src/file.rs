use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_protocol::{JournalEntry, SessionId, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

use crate::{Persistence, PersistenceError, PersistenceResult, replay};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    session_id: SessionId,
    covers_through_seq: u64,
    taken_at: DateTime<Utc>,
    /// Hex SHA-256 of the compact JSON encoding of `state`.
    state_hash: String,
    state: Value,
}

fn state_hash(state: &Value) -> PersistenceResult<String> {
    let bytes = serde_json::to_vec(state).map_err(|e| PersistenceError::Io(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Filesystem persistence rooted at a data directory:
///
/// - `journal/<session>.jsonl`: append-only journal, one entry per line
/// - `snapshots/<session>.json`: newest snapshot, replaced atomically
#[derive(Debug)]
pub struct FilePersistence {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    sequence_cache: Mutex<HashMap<SessionId, u64>>,
    hot: Mutex<HashMap<SessionId, SessionState>>,
}

impl FilePersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            sequence_cache: Mutex::new(HashMap::new()),
            hot: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn journal_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("journal")
            .join(format!("{}.jsonl", session_id.as_str()))
    }

    fn snapshot_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("snapshots")
            .join(format!("{}.json", session_id.as_str()))
    }

    /// Forget the in-memory copy so the next recovery reads from disk.
    pub fn evict(&self, session_id: &SessionId) {
        self.hot.lock().remove(session_id);
        self.sequence_cache.lock().remove(session_id);
    }

    async fn ensure_parent(path: &Path) -> PersistenceResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_entries(
        &self,
        session_id: &SessionId,
    ) -> PersistenceResult<Option<Vec<JournalEntry>>> {
        let path = self.journal_path(session_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        let mut line_number = 0_usize;
        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line).map_err(|error| {
                PersistenceError::corrupt(
                    session_id,
                    format!("journal line {line_number} is unreadable: {error}"),
                )
            })?;
            entries.push(entry);
        }
        Ok(Some(entries))
    }

    async fn read_snapshot(
        &self,
        session_id: &SessionId,
    ) -> PersistenceResult<Option<SessionState>> {
        let path = self.snapshot_path(session_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let raw = fs::read(&path).await?;
        let file: SnapshotFile = serde_json::from_slice(&raw).map_err(|error| {
            PersistenceError::corrupt(session_id, format!("snapshot is unreadable: {error}"))
        })?;
        if file.session_id != *session_id {
            return Err(PersistenceError::corrupt(
                session_id,
                format!("snapshot belongs to session {}", file.session_id),
            ));
        }
        if state_hash(&file.state)? != file.state_hash {
            return Err(PersistenceError::corrupt(
                session_id,
                "snapshot hash mismatch",
            ));
        }
        let state: SessionState = serde_json::from_value(file.state).map_err(|error| {
            PersistenceError::corrupt(session_id, format!("snapshot state is invalid: {error}"))
        })?;
        if state.last_sequence != file.covers_through_seq {
            return Err(PersistenceError::corrupt(
                session_id,
                "snapshot sequence does not match its state",
            ));
        }
        Ok(Some(state))
    }

    async fn load_latest_sequence(&self, session_id: &SessionId) -> PersistenceResult<u64> {
        if let Some(latest) = self.sequence_cache.lock().get(session_id).copied() {
            return Ok(latest);
        }
        let journal = self
            .read_entries(session_id)
            .await?
            .and_then(|entries| entries.last().map(|entry| entry.sequence))
            .unwrap_or(0);
        let snapshot = self
            .read_snapshot(session_id)
            .await?
            .map_or(0, |state| state.last_sequence);
        let latest = journal.max(snapshot);
        self.sequence_cache
            .lock()
            .insert(session_id.clone(), latest);
        Ok(latest)
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    #[instrument(
        skip(self, entry),
        fields(session_id = %entry.session_id, sequence = entry.sequence)
    )]
    async fn append_event(&self, entry: &JournalEntry) -> PersistenceResult<()> {
        let path = self.journal_path(&entry.session_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(&entry.session_id);
        let _guard = lock.lock().await;

        let latest = self.load_latest_sequence(&entry.session_id).await?;
        let expected = latest.saturating_add(1);
        if entry.sequence != expected {
            warn!(
                expected,
                actual = entry.sequence,
                "sequence conflict while appending journal entry"
            );
            return Err(PersistenceError::SequenceConflict {
                session_id: entry.session_id.clone(),
                expected,
                actual: entry.sequence,
            });
        }

        let mut line =
            serde_json::to_vec(entry).map_err(|e| PersistenceError::Io(e.to_string()))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        self.sequence_cache
            .lock()
            .insert(entry.session_id.clone(), entry.sequence);
        let mut hot = self.hot.lock();
        if let Some(state) = hot.get_mut(&entry.session_id) {
            state.apply(entry);
        } else if entry.sequence == 1 {
            let mut state = SessionState::new(entry.session_id.clone());
            state.apply(entry);
            hot.insert(entry.session_id.clone(), state);
        }
        debug!("journal entry appended");
        Ok(())
    }

    #[instrument(skip(self, state), fields(session_id = %session_id, covers = state.last_sequence))]
    async fn snapshot(
        &self,
        session_id: &SessionId,
        state: &SessionState,
    ) -> PersistenceResult<()> {
        let path = self.snapshot_path(session_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let value = serde_json::to_value(state).map_err(|e| PersistenceError::Io(e.to_string()))?;
        let file = SnapshotFile {
            session_id: session_id.clone(),
            covers_through_seq: state.last_sequence,
            taken_at: Utc::now(),
            state_hash: state_hash(&value)?,
            state: value,
        };
        let bytes =
            serde_json::to_vec_pretty(&file).map_err(|e| PersistenceError::Io(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;

        self.hot.lock().insert(session_id.clone(), state.clone());
        let mut cache = self.sequence_cache.lock();
        let latest = cache.entry(session_id.clone()).or_insert(0);
        *latest = (*latest).max(state.last_sequence);
        info!("snapshot written");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn recover(&self, session_id: &SessionId) -> PersistenceResult<SessionState> {
        if let Some(state) = self.hot.lock().get(session_id).cloned() {
            debug!(sequence = state.last_sequence, "recovered from hot cache");
            return Ok(state);
        }

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let snapshot = self.read_snapshot(session_id).await?;
        let journal = self.read_entries(session_id).await?;
        let state = match (snapshot, journal) {
            (None, None) => return Err(PersistenceError::NotFound(session_id.clone())),
            (snapshot, journal) => {
                let base = snapshot.unwrap_or_else(|| SessionState::new(session_id.clone()));
                replay(session_id, base, journal.unwrap_or_default())?
            }
        };

        self.hot.lock().insert(session_id.clone(), state.clone());
        self.sequence_cache
            .lock()
            .insert(session_id.clone(), state.last_sequence);
        info!(sequence = state.last_sequence, "session state recovered");
        Ok(state)
    }

    async fn latest_sequence(&self, session_id: &SessionId) -> PersistenceResult<u64> {
        self.load_latest_sequence(session_id).await
    }

    async fn read_journal(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
    ) -> PersistenceResult<Vec<JournalEntry>> {
        let entries = self.read_entries(session_id).await?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|entry| entry.sequence >= from_sequence)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use arbor_protocol::JournalRecord;
    use serde_json::json;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn set(session: &SessionId, sequence: u64, key: &str, value: Value) -> JournalEntry {
        JournalEntry::new(
            session.clone(),
            sequence,
            JournalRecord::StateSet {
                key: key.into(),
                value,
            },
        )
    }

    async fn write_entries(
        store: &FilePersistence,
        session: &SessionId,
        range: std::ops::RangeInclusive<u64>,
    ) -> Result<SessionState> {
        let mut state = SessionState::new(session.clone());
        for sequence in range {
            let entry = set(session, sequence, &format!("k{sequence}"), json!(sequence));
            store.append_event(&entry).await?;
            state.apply(&entry);
        }
        Ok(state)
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() -> Result<()> {
        let root = unique_test_root("arbor-persistence-snapshot");
        let store = FilePersistence::new(&root);
        let session = SessionId::from_string("S1");
        let state = write_entries(&store, &session, 1..=3).await?;

        store.snapshot(&session, &state).await?;
        store.evict(&session);
        assert_eq!(store.recover(&session).await?, state);

        let reopened = FilePersistence::new(&root);
        assert_eq!(reopened.recover(&session).await?, state);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn recovery_replays_journal_after_snapshot() -> Result<()> {
        let root = unique_test_root("arbor-persistence-replay");
        let store = FilePersistence::new(&root);
        let session = SessionId::from_string("S1");
        let mut state = write_entries(&store, &session, 1..=2).await?;
        store.snapshot(&session, &state).await?;

        for sequence in 3..=5 {
            let entry = set(&session, sequence, "counter", json!(sequence));
            store.append_event(&entry).await?;
            state.apply(&entry);
        }

        let hot = store.recover(&session).await?;
        assert_eq!(hot, state);

        let cold = FilePersistence::new(&root).recover(&session).await?;
        assert_eq!(cold, state);
        assert_eq!(cold.last_sequence, 5);
        assert_eq!(cold.get("counter"), Some(&json!(5)));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn append_rejects_duplicate_and_gap() -> Result<()> {
        let root = unique_test_root("arbor-persistence-seq");
        let store = FilePersistence::new(&root);
        let session = SessionId::from_string("S1");
        write_entries(&store, &session, 1..=1).await?;

        let duplicate = store.append_event(&set(&session, 1, "k", json!(0))).await;
        let Err(error) = duplicate else {
            anyhow::bail!("duplicate sequence accepted");
        };
        assert!(error.to_string().contains("expected 2, got 1"));

        let gap = store.append_event(&set(&session, 5, "k", json!(0))).await;
        assert!(matches!(
            gap,
            Err(PersistenceError::SequenceConflict {
                expected: 2,
                actual: 5,
                ..
            })
        ));
        assert_eq!(store.latest_sequence(&session).await?, 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() -> Result<()> {
        let root = unique_test_root("arbor-persistence-missing");
        let store = FilePersistence::new(&root);
        let missing = store.recover(&SessionId::from_string("nope")).await;
        assert!(matches!(missing, Err(PersistenceError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn tampered_snapshot_is_corrupt() -> Result<()> {
        let root = unique_test_root("arbor-persistence-tamper");
        let store = FilePersistence::new(&root);
        let session = SessionId::from_string("S1");
        let state = write_entries(&store, &session, 1..=2).await?;
        store.snapshot(&session, &state).await?;

        let path = store.snapshot_path(&session);
        let raw = fs::read_to_string(&path).await?;
        fs::write(&path, raw.replace("\"k1\": 1", "\"k1\": 999")).await?;

        let reopened = FilePersistence::new(&root);
        let result = reopened.recover(&session).await;
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn garbled_journal_line_is_corrupt() -> Result<()> {
        let root = unique_test_root("arbor-persistence-garbled");
        let store = FilePersistence::new(&root);
        let session = SessionId::from_string("S1");
        write_entries(&store, &session, 1..=2).await?;

        let path = store.journal_path(&session);
        let mut file = OpenOptions::new().append(true).open(&path).await?;
        file.write_all(b"{\"session_id\": \"S1\", \"sequ").await?;
        file.flush().await?;

        let result = FilePersistence::new(&root).recover(&session).await;
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
