use std::collections::HashMap;

use arbor_protocol::{JournalEntry, SessionId, SessionState};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Persistence, PersistenceError, PersistenceResult, replay};

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<JournalEntry>,
    snapshot: Option<SessionState>,
}

impl Stream {
    fn latest(&self) -> u64 {
        let journal = self.entries.last().map_or(0, |entry| entry.sequence);
        let snapshot = self
            .snapshot
            .as_ref()
            .map_or(0, |state| state.last_sequence);
        journal.max(snapshot)
    }
}

/// Process-local persistence with the same sequencing and recovery rules as
/// [`crate::FilePersistence`]. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    streams: Mutex<HashMap<SessionId, Stream>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal_len(&self, session_id: &SessionId) -> usize {
        self.streams
            .lock()
            .get(session_id)
            .map_or(0, |stream| stream.entries.len())
    }

    pub fn has_snapshot(&self, session_id: &SessionId) -> bool {
        self.streams
            .lock()
            .get(session_id)
            .is_some_and(|stream| stream.snapshot.is_some())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn append_event(&self, entry: &JournalEntry) -> PersistenceResult<()> {
        let mut streams = self.streams.lock();
        let stream = streams.entry(entry.session_id.clone()).or_default();
        let expected = stream.latest() + 1;
        if entry.sequence != expected {
            return Err(PersistenceError::SequenceConflict {
                session_id: entry.session_id.clone(),
                expected,
                actual: entry.sequence,
            });
        }
        stream.entries.push(entry.clone());
        Ok(())
    }

    async fn snapshot(
        &self,
        session_id: &SessionId,
        state: &SessionState,
    ) -> PersistenceResult<()> {
        self.streams
            .lock()
            .entry(session_id.clone())
            .or_default()
            .snapshot = Some(state.clone());
        Ok(())
    }

    async fn recover(&self, session_id: &SessionId) -> PersistenceResult<SessionState> {
        let (base, entries) = {
            let streams = self.streams.lock();
            let stream = streams
                .get(session_id)
                .ok_or_else(|| PersistenceError::NotFound(session_id.clone()))?;
            let base = stream
                .snapshot
                .clone()
                .unwrap_or_else(|| SessionState::new(session_id.clone()));
            (base, stream.entries.clone())
        };
        replay(session_id, base, entries)
    }

    async fn latest_sequence(&self, session_id: &SessionId) -> PersistenceResult<u64> {
        Ok(self
            .streams
            .lock()
            .get(session_id)
            .map_or(0, Stream::latest))
    }

    async fn read_journal(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
    ) -> PersistenceResult<Vec<JournalEntry>> {
        Ok(self
            .streams
            .lock()
            .get(session_id)
            .map(|stream| {
                stream
                    .entries
                    .iter()
                    .filter(|entry| entry.sequence >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use arbor_protocol::JournalRecord;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn recover_equals_snapshot_when_nothing_follows() -> Result<()> {
        let store = MemoryPersistence::new();
        let session = SessionId::from_string("S1");
        let mut state = SessionState::new(session.clone());
        for sequence in 1..=3 {
            let entry = JournalEntry::new(
                session.clone(),
                sequence,
                JournalRecord::StateSet {
                    key: "model".into(),
                    value: json!(format!("m{sequence}")),
                },
            );
            store.append_event(&entry).await?;
            state.apply(&entry);
        }
        store.snapshot(&session, &state).await?;
        assert!(store.has_snapshot(&session));
        assert_eq!(store.recover(&session).await?, state);
        assert_eq!(store.latest_sequence(&session).await?, 3);
        assert_eq!(store.read_journal(&session, 2).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let store = MemoryPersistence::new();
        assert!(matches!(
            store.recover(&SessionId::from_string("ghost")).await,
            Err(PersistenceError::NotFound(_))
        ));
    }
}
