use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::CompletionError;
use crate::session::{SessionEntry, SessionId};
use crate::token::SeqId;

struct RegistryInner<C> {
    sessions: HashMap<SessionId, Arc<SessionEntry<C>>>,
    /// Monotonically increasing counter used to mint fresh sequence IDs when
    /// the free-list is empty.
    next_seq_id: SeqId,
    /// Sequence IDs returned by released sessions, reused before minting.
    free_seq_ids: Vec<SeqId>,
}

/// Thread-safe map from session id to session.
///
/// Entries are created by `start`, read by `step` / `cancel` and removed by
/// `release`; nothing is evicted implicitly. The registry also owns the
/// pool of engine sequence ids, one per live (or starting) session, which
/// bounds the number of concurrent sessions to `max_sessions`.
pub(crate) struct SessionRegistry<C> {
    inner: Mutex<RegistryInner<C>>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl<C> SessionRegistry<C> {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                next_seq_id: 0,
                free_seq_ids: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, RegistryInner<C>>, CompletionError> {
        self.inner
            .lock()
            .map_err(|_| CompletionError::LockPoisoned { operation })
    }

    /// Mint the next session id.
    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserve a sequence id for a session about to start.
    pub(crate) fn acquire_sequence(&self) -> Result<SeqId, CompletionError> {
        let mut inner = self.lock("acquire sequence id")?;
        if let Some(seq_id) = inner.free_seq_ids.pop() {
            return Ok(seq_id);
        }
        let minted = usize::try_from(inner.next_seq_id).unwrap_or(usize::MAX);
        if minted >= self.max_sessions {
            return Err(CompletionError::CapacityExhausted {
                max_sessions: self.max_sessions,
            });
        }
        let seq_id = inner.next_seq_id;
        inner.next_seq_id += 1;
        Ok(seq_id)
    }

    /// Return a sequence id to the pool.
    pub(crate) fn release_sequence(&self, seq_id: SeqId) -> Result<(), CompletionError> {
        let mut inner = self.lock("release sequence id")?;
        debug_assert!(
            !inner.free_seq_ids.contains(&seq_id),
            "sequence id {seq_id} released twice"
        );
        inner.free_seq_ids.push(seq_id);
        Ok(())
    }

    pub(crate) fn insert(&self, entry: Arc<SessionEntry<C>>) -> Result<(), CompletionError> {
        self.lock("register session")?
            .sessions
            .insert(entry.id, entry);
        Ok(())
    }

    pub(crate) fn get(
        &self,
        id: SessionId,
    ) -> Result<Option<Arc<SessionEntry<C>>>, CompletionError> {
        Ok(self.lock("look up session")?.sessions.get(&id).cloned())
    }

    /// Remove and return the entry for `id`, if any. Removing twice is a no-op.
    pub(crate) fn remove(
        &self,
        id: SessionId,
    ) -> Result<Option<Arc<SessionEntry<C>>>, CompletionError> {
        Ok(self.lock("remove session")?.sessions.remove(&id))
    }

    pub(crate) fn ids(&self) -> Result<Vec<SessionId>, CompletionError> {
        let mut ids: Vec<SessionId> = self.lock("list sessions")?.sessions.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub(crate) fn entries(&self) -> Result<Vec<Arc<SessionEntry<C>>>, CompletionError> {
        Ok(self
            .lock("list sessions")?
            .sessions
            .values()
            .cloned()
            .collect())
    }

    pub(crate) fn len(&self) -> Result<usize, CompletionError> {
        Ok(self.lock("count sessions")?.sessions.len())
    }
}
