//! Durable copies of session state.
//!
//! Three tiers: a hot in-memory copy of each session's latest state, a warm
//! append-only journal of [`JournalEntry`]s, and cold snapshots. Recovery
//! loads the newest snapshot and replays every later journal entry in order.
//! Anything that cannot be replayed exactly is reported as
//! [`PersistenceError::Corrupt`], never papered over with an empty state.

mod file;
mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use arbor_protocol::{ErrorKind, JournalEntry, SessionId, SessionState};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("no persisted state for session {0}")]
    NotFound(SessionId),
    #[error("persisted state for session {session_id} is corrupt: {reason}")]
    Corrupt {
        session_id: SessionId,
        reason: String,
    },
    #[error("storage failure: {0}")]
    Io(String),
    #[error("sequence conflict for session {session_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Resource,
            Self::Corrupt { .. } | Self::SequenceConflict { .. } => ErrorKind::SystemFault,
        }
    }

    fn corrupt(session_id: &SessionId, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            session_id: session_id.clone(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Append one entry to the session's journal. `entry.sequence` must be
    /// exactly one past the latest persisted sequence.
    async fn append_event(&self, entry: &JournalEntry) -> PersistenceResult<()>;

    /// Store `state` as the session's newest snapshot. It covers every entry up
    /// to `state.last_sequence`.
    async fn snapshot(&self, session_id: &SessionId, state: &SessionState)
    -> PersistenceResult<()>;

    async fn recover(&self, session_id: &SessionId) -> PersistenceResult<SessionState>;

    async fn latest_sequence(&self, session_id: &SessionId) -> PersistenceResult<u64>;

    /// Journal entries with `sequence >= from_sequence`, in order.
    async fn read_journal(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
    ) -> PersistenceResult<Vec<JournalEntry>>;
}

/// Fold `entries` that come after `base.last_sequence` into `base`, requiring
/// they form a gap-free run.
pub(crate) fn replay(
    session_id: &SessionId,
    mut base: SessionState,
    entries: impl IntoIterator<Item = JournalEntry>,
) -> PersistenceResult<SessionState> {
    for entry in entries {
        if entry.sequence <= base.last_sequence {
            continue;
        }
        let expected = base.last_sequence + 1;
        if entry.sequence != expected {
            return Err(PersistenceError::corrupt(
                session_id,
                format!("journal gap: expected {expected}, found {}", entry.sequence),
            ));
        }
        if entry.session_id != *session_id {
            return Err(PersistenceError::corrupt(
                session_id,
                format!("entry {} belongs to session {}", entry.sequence, entry.session_id),
            ));
        }
        base.apply(&entry);
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use arbor_protocol::JournalRecord;
    use serde_json::json;

    use super::*;

    fn set(session: &SessionId, sequence: u64, key: &str) -> JournalEntry {
        JournalEntry::new(
            session.clone(),
            sequence,
            JournalRecord::StateSet {
                key: key.into(),
                value: json!(sequence),
            },
        )
    }

    #[test]
    fn replay_skips_covered_entries_and_rejects_gaps() {
        let session = SessionId::from_string("S1");
        let mut base = SessionState::new(session.clone());
        base.apply(&set(&session, 1, "a"));

        let state = replay(
            &session,
            base.clone(),
            [set(&session, 1, "a"), set(&session, 2, "b")],
        )
        .unwrap();
        assert_eq!(state.last_sequence, 2);
        assert_eq!(state.version, 2);

        let gap = replay(&session, base, [set(&session, 3, "c")]);
        assert!(matches!(gap, Err(PersistenceError::Corrupt { .. })));
    }

    #[test]
    fn error_kinds_map_to_taxonomy() {
        assert_eq!(
            PersistenceError::Io("disk full".into()).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            PersistenceError::NotFound(SessionId::from_string("S")).kind(),
            ErrorKind::Validation
        );
    }
}
