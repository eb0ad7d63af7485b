use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use serde::Serialize;
use strum::{Display, IntoStaticStr};

use crate::error::CompletionError;
use crate::sampler::ChainSlot;
use crate::token::{Pos, SeqId, Token};

/// Opaque identifier of a generation session.
///
/// Ids are handed out in increasing order and are only ever validated by
/// looking them up in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a session. Variants are declared in transition order and a
/// session only ever moves forward through them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    ProcessingPrompt,
    Generating,
    Completed,
    Cancelled,
    /// A generated token could not be converted or fed back into context.
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Why a session produced its final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The engine sampled an end-of-generation token.
    Stop,
    /// The caller's token budget was reached.
    Length,
}

/// State machine for one generation request.
#[derive(Debug)]
pub(crate) struct Session<C> {
    pub(crate) id: SessionId,
    pub(crate) prompt: String,
    pub(crate) prompt_tokens: Vec<Token>,
    pub(crate) generated_tokens: Vec<Token>,
    /// Decoded text of `generated_tokens`.
    pub(crate) current_text: String,
    /// Next position to write into the running context.
    pub(crate) current_pos: Pos,
    pub(crate) state: TaskState,
    pub(crate) chain: ChainSlot<C>,
    pub(crate) max_tokens: usize,
    /// Sequence in the running context this session decodes into.
    pub(crate) seq_id: SeqId,
    pub(crate) last_active: Instant,
}

impl<C> Session<C> {
    pub(crate) fn new(id: SessionId, prompt: String, max_tokens: usize, seq_id: SeqId) -> Self {
        Self {
            id,
            prompt,
            prompt_tokens: Vec::new(),
            generated_tokens: Vec::new(),
            current_text: String::new(),
            current_pos: 0,
            state: TaskState::Pending,
            chain: ChainSlot::Shared,
            max_tokens,
            seq_id,
            last_active: Instant::now(),
        }
    }

    /// Move to `next`. Transitions never go backwards and terminal states
    /// are absorbing.
    pub(crate) fn advance(&mut self, next: TaskState) {
        debug_assert!(
            next > self.state && !self.state.is_terminal(),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        if next > self.state && !self.state.is_terminal() {
            self.state = next;
        }
    }

    pub(crate) fn mark_cancelled(&mut self) {
        if !self.state.is_terminal() {
            self.advance(TaskState::Cancelled);
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub(crate) fn budget_exhausted(&self) -> bool {
        self.generated_tokens.len() >= self.max_tokens
    }

    pub(crate) fn info(&self, cancelled: bool) -> SessionInfo {
        SessionInfo {
            id: self.id,
            prompt: self.prompt.clone(),
            state: self.state,
            prompt_tokens: self.prompt_tokens.len(),
            generated_tokens: self.generated_tokens.len(),
            max_tokens: self.max_tokens,
            current_pos: self.current_pos,
            cancelled,
            constrained: self.chain.is_owned(),
        }
    }
}

/// A registry entry: the session plus its lock-free cancellation flag.
///
/// `cancelled` is written by `cancel` from any thread and read at the top of
/// every step without touching the session lock.
#[derive(Debug)]
pub(crate) struct SessionEntry<C> {
    pub(crate) id: SessionId,
    cancelled: AtomicBool,
    session: Mutex<Session<C>>,
}

impl<C> SessionEntry<C> {
    pub(crate) fn new(session: Session<C>) -> Self {
        Self {
            id: session.id,
            cancelled: AtomicBool::new(false),
            session: Mutex::new(session),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Lock the session for a step. At most one step may be in flight per
    /// session; a second concurrent caller gets [`CompletionError::SessionBusy`].
    pub(crate) fn try_lock(&self) -> Result<MutexGuard<'_, Session<C>>, CompletionError> {
        match self.session.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(CompletionError::SessionBusy {
                session_id: self.id,
            }),
            Err(TryLockError::Poisoned(_)) => Err(CompletionError::LockPoisoned {
                operation: "lock session for step",
            }),
        }
    }

    /// Lock the session, waiting for any in-flight step to finish.
    pub(crate) fn lock(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, Session<C>>, CompletionError> {
        self.session
            .lock()
            .map_err(|_| CompletionError::LockPoisoned { operation })
    }
}

/// A point-in-time view of a session, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub prompt: String,
    pub state: TaskState,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub max_tokens: usize,
    pub current_pos: Pos,
    pub cancelled: bool,
    /// `true` if the session samples through a private grammar chain.
    pub constrained: bool,
}
