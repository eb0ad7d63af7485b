use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::batch::TokenBatch;
use crate::config::CompletionConfig;
use crate::engine::Engine;
use crate::error::CompletionError;
use crate::registry::SessionRegistry;
use crate::request::{CompletionRequest, StepOutput};
use crate::sampler::{self, ChainSlot};
use crate::session::{FinishReason, Session, SessionEntry, SessionId, SessionInfo, TaskState};
use crate::token::SeqId;

/// The engine together with the chain shared by every unconstrained session.
struct EngineSlot<E: Engine> {
    engine: E,
    default_chain: E::Chain,
}

/// Incremental text generation over an [`Engine`].
///
/// Callers drive each session explicitly:
///
/// 1. [`start`](Self::start) tokenizes the prompt, decodes it and registers
///    the session.
/// 2. [`step`](Self::step) produces one token per call until a final output.
/// 3. [`cancel`](Self::cancel) may be called from any thread at any time.
/// 4. [`release`](Self::release) frees the session's resources. Every
///    started session must be released.
///
/// At most one `step` may be in flight per session; a concurrent second call
/// fails with [`CompletionError::SessionBusy`]. Steps of different sessions
/// may run on different threads; engine calls are serialized internally.
///
/// Fields are declared in teardown order: sessions, and with them their
/// private chains, are dropped before the engine.
pub struct CompletionService<E: Engine> {
    config: CompletionConfig,
    registry: SessionRegistry<E::Chain>,
    engine: Mutex<EngineSlot<E>>,
}

impl<E: Engine> CompletionService<E> {
    pub fn new(mut engine: E, config: CompletionConfig) -> Self {
        let default_chain = sampler::default_chain(&mut engine, &config.selection);
        info!(
            max_sessions = config.max_sessions,
            default_n_predict = config.default_n_predict,
            selection = ?config.selection,
            "completion service ready"
        );
        Self {
            registry: SessionRegistry::new(config.max_sessions),
            engine: Mutex::new(EngineSlot {
                engine,
                default_chain,
            }),
            config,
        }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    fn engine(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, EngineSlot<E>>, CompletionError> {
        self.engine
            .lock()
            .map_err(|_| CompletionError::LockPoisoned { operation })
    }

    // ── Session protocol ─────────────────────────────────────────────────────

    /// Start a session: compile the grammar (if any), tokenize the prompt and
    /// decode it into a fresh engine sequence.
    ///
    /// Nothing is registered unless every stage succeeds.
    pub fn start(&self, request: &CompletionRequest) -> Result<SessionId, CompletionError> {
        request.validate()?;
        let max_tokens = request.n_predict.unwrap_or(self.config.default_n_predict);
        let id = self.registry.next_session_id();
        let seq_id = self.registry.acquire_sequence()?;

        let session = match self.prepare(id, request, max_tokens, seq_id) {
            Ok(session) => session,
            Err(e) => {
                self.abandon_sequence(seq_id);
                return Err(e);
            }
        };

        let prompt_tokens = session.prompt_tokens.len();
        let constrained = session.chain.is_owned();
        if let Err(e) = self.registry.insert(Arc::new(SessionEntry::new(session))) {
            self.abandon_sequence(seq_id);
            return Err(e);
        }

        info!(
            session_id = %id,
            seq_id,
            prompt_tokens,
            max_tokens,
            constrained,
            "session started"
        );
        Ok(id)
    }

    fn prepare(
        &self,
        id: SessionId,
        request: &CompletionRequest,
        max_tokens: usize,
        seq_id: SeqId,
    ) -> Result<Session<E::Chain>, CompletionError> {
        let mut session = Session::new(id, request.prompt.clone(), max_tokens, seq_id);
        let mut slot = self.engine("start session")?;
        let engine = &mut slot.engine;

        session.chain = sampler::build_chain(
            engine,
            request.grammar(),
            &self.config.grammar_root,
            &self.config.selection,
        )?;

        let tokens = engine
            .tokenize(&request.prompt, true)
            .map_err(|source| CompletionError::TokenizeFailed { source })?;
        if tokens.is_empty() {
            return Err(CompletionError::InvalidRequest {
                reason: "prompt produced no tokens".to_owned(),
            });
        }

        session.advance(TaskState::ProcessingPrompt);
        engine.clear_sequence(seq_id);
        let batch = TokenBatch::prompt(&tokens, seq_id)?;
        if let Err(source) = engine.decode(&batch) {
            warn!(session_id = %id, seq_id, error = %source, "prompt decode failed");
            return Err(CompletionError::PromptDecodeFailed {
                session_id: id,
                source,
            });
        }

        session.current_pos = batch.positions().last().map_or(0, |pos| pos + 1);
        session.prompt_tokens = tokens;
        session.advance(TaskState::Generating);
        Ok(session)
    }

    /// Clear a sequence that never made it into the registry and return it
    /// to the pool.
    fn abandon_sequence(&self, seq_id: SeqId) {
        match self.engine("abandon sequence") {
            Ok(mut slot) => slot.engine.clear_sequence(seq_id),
            Err(e) => warn!(seq_id, error = %e, "could not clear abandoned sequence"),
        }
        if let Err(e) = self.registry.release_sequence(seq_id) {
            warn!(seq_id, error = %e, "could not return sequence id to the pool");
        }
    }

    /// Advance a session by exactly one token.
    ///
    /// Returns `Ok(None)` for unknown, cancelled or finished sessions. A
    /// non-final output carries the newest fragment only; the final output
    /// carries the whole generated text.
    pub fn step(&self, id: SessionId) -> Result<Option<StepOutput>, CompletionError> {
        let Some(entry) = self.registry.get(id)? else {
            debug!(session_id = %id, "step on unknown session");
            return Ok(None);
        };

        let Some(mut session) = lock_for_step(&entry)? else {
            return Ok(None);
        };
        if session.state.is_terminal() {
            return Ok(None);
        }
        session.touch();

        if session.budget_exhausted() {
            session.advance(TaskState::Completed);
            info!(
                session_id = %id,
                generated_tokens = session.generated_tokens.len(),
                "session reached its token budget"
            );
            return Ok(Some(StepOutput::finished(
                session.current_text.clone(),
                FinishReason::Length,
            )));
        }

        let mut slot = self.engine("step session")?;
        let EngineSlot {
            engine,
            default_chain,
        } = &mut *slot;
        let seq_id = session.seq_id;

        let token = match &mut session.chain {
            ChainSlot::Owned(chain) => {
                let token = engine.sample(chain, seq_id);
                engine.accept(chain, token);
                token
            }
            ChainSlot::Shared => engine.sample(default_chain, seq_id),
        };

        if engine.is_eog(token) {
            session.advance(TaskState::Completed);
            info!(
                session_id = %id,
                generated_tokens = session.generated_tokens.len(),
                "session finished at end of generation"
            );
            return Ok(Some(StepOutput::finished(
                session.current_text.clone(),
                FinishReason::Stop,
            )));
        }

        session.generated_tokens.push(token);
        let piece = match engine.token_to_piece(token) {
            Ok(piece) => piece,
            Err(source) => {
                session.advance(TaskState::Failed);
                warn!(session_id = %id, token, error = %source, "token to piece failed");
                return Err(CompletionError::TokenToPieceFailed {
                    session_id: id,
                    source,
                });
            }
        };
        session.current_text.push_str(&piece);

        let pos = session.current_pos;
        if let Err(source) = engine.decode(&TokenBatch::single(token, pos, seq_id)) {
            session.advance(TaskState::Failed);
            warn!(session_id = %id, token, pos, error = %source, "decode of generated token failed");
            return Err(CompletionError::DecodeFailed {
                session_id: id,
                source,
            });
        }
        session.current_pos += 1;

        debug!(session_id = %id, token, pos, piece = %piece, "generated token");
        Ok(Some(StepOutput::fragment(piece)))
    }

    /// Request cancellation. Resources stay allocated until `release`.
    pub fn cancel(&self, id: SessionId) -> Result<(), CompletionError> {
        let Some(entry) = self.registry.get(id)? else {
            debug!(session_id = %id, "cancel on unknown session");
            return Ok(());
        };
        entry.cancel();
        // A step in flight will observe the flag on the next call instead.
        if let Ok(mut session) = entry.try_lock() {
            session.mark_cancelled();
        }
        info!(session_id = %id, "session cancelled");
        Ok(())
    }

    /// Remove a session, free its private chain and clear its engine
    /// sequence. Releasing an unknown or already released id is a no-op.
    pub fn release(&self, id: SessionId) -> Result<(), CompletionError> {
        let Some(entry) = self.registry.remove(id)? else {
            debug!(session_id = %id, "release of unknown session");
            return Ok(());
        };
        entry.cancel();

        // Waits for an in-flight step to finish.
        let (seq_id, chain, state) = {
            let mut session = entry.lock("release session")?;
            let chain = std::mem::replace(&mut session.chain, ChainSlot::Shared);
            (session.seq_id, chain, session.state)
        };
        let constrained = chain.is_owned();

        {
            let mut slot = self.engine("release session")?;
            drop(chain);
            slot.engine.clear_sequence(seq_id);
        }
        self.registry.release_sequence(seq_id)?;

        info!(session_id = %id, seq_id, %state, constrained, "session released");
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn status(&self, id: SessionId) -> Result<Option<SessionInfo>, CompletionError> {
        let Some(entry) = self.registry.get(id)? else {
            return Ok(None);
        };
        let session = entry.lock("read session status")?;
        Ok(Some(session.info(entry.is_cancelled())))
    }

    /// Ids of every registered session, oldest first.
    pub fn session_ids(&self) -> Result<Vec<SessionId>, CompletionError> {
        self.registry.ids()
    }

    pub fn len(&self) -> Result<usize, CompletionError> {
        self.registry.len()
    }

    pub fn is_empty(&self) -> Result<bool, CompletionError> {
        Ok(self.registry.len()? == 0)
    }

    /// Release every registered session. Returns how many were released.
    pub fn shutdown(&self) -> Result<usize, CompletionError> {
        let ids = self.registry.ids()?;
        for &id in &ids {
            self.release(id)?;
        }
        info!(released = ids.len(), "completion service shut down");
        Ok(ids.len())
    }

    /// Release sessions that have not been stepped for longer than
    /// `max_idle`. Sessions with a step in flight are skipped.
    pub fn sweep_idle(&self, max_idle: Duration) -> Result<Vec<SessionId>, CompletionError> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.registry.entries()? {
            let idle = match entry.try_lock() {
                Ok(session) => now.saturating_duration_since(session.last_active),
                Err(CompletionError::SessionBusy { .. }) => continue,
                Err(e) => return Err(e),
            };
            if idle > max_idle {
                expired.push(entry.id);
            }
        }

        expired.sort_unstable();
        for &id in &expired {
            self.release(id)?;
            warn!(session_id = %id, max_idle_ms = saturating_millis(max_idle), "released idle session");
        }
        Ok(expired)
    }

    // ── Convenience drivers ──────────────────────────────────────────────────

    /// Generate the whole completion for `request` and release the session.
    pub fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let id = self.start(request)?;
        let outcome = self.run_to_end(id);
        let released = self.release(id);
        let text = outcome?;
        released?;
        Ok(text)
    }

    fn run_to_end(&self, id: SessionId) -> Result<String, CompletionError> {
        let mut text = String::new();
        while let Some(output) = self.step(id)? {
            if output.is_final {
                return Ok(output.text);
            }
            text.push_str(&output.text);
        }
        Ok(text)
    }

    /// Start a session and iterate over its fragments.
    ///
    /// The session is released when the returned [`Generation`] is dropped.
    pub fn generate(&self, request: &CompletionRequest) -> Result<Generation<'_, E>, CompletionError> {
        let id = self.start(request)?;
        Ok(Generation {
            service: self,
            id,
            text: String::new(),
            finish_reason: None,
            done: false,
        })
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Take the step lock, or `None` if the session was cancelled.
///
/// A cancelled session yields `None` even while another caller holds the
/// lock. `release` raises the flag before locking, so a step that fetched
/// the entry just before its removal observes the flag here.
fn lock_for_step<C>(
    entry: &SessionEntry<C>,
) -> Result<Option<MutexGuard<'_, Session<C>>>, CompletionError> {
    if entry.is_cancelled() {
        match entry.try_lock() {
            Ok(mut session) => session.mark_cancelled(),
            Err(CompletionError::SessionBusy { .. }) => {}
            Err(e) => return Err(e),
        }
        return Ok(None);
    }

    match entry.try_lock() {
        Ok(mut session) => {
            if entry.is_cancelled() {
                session.mark_cancelled();
                return Ok(None);
            }
            Ok(Some(session))
        }
        Err(CompletionError::SessionBusy { .. }) if entry.is_cancelled() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Blocking iterator over the fragments of one session.
///
/// Yields each generated fragment; ends after the final output, after
/// cancellation, or after the first error.
pub struct Generation<'a, E: Engine> {
    service: &'a CompletionService<E>,
    id: SessionId,
    text: String,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl<E: Engine> Generation<'_, E> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Text generated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Why generation ended; `None` while running or after cancellation.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn cancel(&self) -> Result<(), CompletionError> {
        self.service.cancel(self.id)
    }
}

impl<E: Engine> Iterator for Generation<'_, E> {
    type Item = Result<String, CompletionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.service.step(self.id) {
            Ok(Some(output)) if output.is_final => {
                self.done = true;
                self.finish_reason = output.finish_reason;
                self.text = output.text;
                None
            }
            Ok(Some(output)) => {
                self.text.push_str(&output.text);
                Some(Ok(output.text))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<E: Engine> Drop for Generation<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.service.release(self.id) {
            warn!(session_id = %self.id, error = %e, "failed to release generation session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedEngine;

    #[test]
    fn concurrent_step_on_same_session_is_rejected() {
        let service = CompletionService::new(
            ScriptedEngine::new(&["blue"]),
            CompletionConfig::default(),
        );
        let id = service
            .start(&CompletionRequest::new("The sky is"))
            .expect("start");

        let entry = service
            .registry
            .get(id)
            .expect("registry lock")
            .expect("registered");
        let _in_flight = entry.try_lock().expect("first lock");

        let err = service.step(id).unwrap_err();
        assert!(matches!(err, CompletionError::SessionBusy { session_id } if session_id == id));

        // Idle sweep never touches a session that is mid-step.
        assert!(service.sweep_idle(Duration::ZERO).expect("sweep").is_empty());
    }

    #[test]
    fn cancelled_session_reports_no_output_even_while_busy() {
        let service = CompletionService::new(
            ScriptedEngine::new(&["blue"]),
            CompletionConfig::default(),
        );
        let id = service
            .start(&CompletionRequest::new("The sky is"))
            .expect("start");
        let entry = service
            .registry
            .get(id)
            .expect("registry lock")
            .expect("registered");

        let held = entry.try_lock().expect("lock");
        service.cancel(id).expect("cancel");
        assert_eq!(held.state, TaskState::Generating);
        assert!(service.step(id).expect("step").is_none());
        drop(held);

        assert!(service.step(id).expect("step").is_none());
        let info = service.status(id).expect("status").expect("registered");
        assert_eq!(info.state, TaskState::Cancelled);
        assert!(info.cancelled);
    }

    #[test]
    fn step_racing_a_release_yields_no_output() {
        let entry = SessionEntry::new(Session::<()>::new(SessionId::from(3), "p".into(), 4, 0));
        let held = entry.try_lock().expect("lock");

        let err = lock_for_step(&entry).err().expect("busy before release");
        assert!(matches!(err, CompletionError::SessionBusy { .. }));

        // `release` raises the flag, then waits on the lock.
        entry.cancel();
        assert!(lock_for_step(&entry).expect("no error").is_none());
        drop(held);

        assert!(lock_for_step(&entry).expect("no error").is_none());
        assert_eq!(entry.lock("inspect").expect("lock").state, TaskState::Cancelled);
    }

    #[test]
    fn idle_durations_saturate_when_logged() {
        assert_eq!(saturating_millis(Duration::from_millis(250)), 250);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
