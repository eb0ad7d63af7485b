//! Deterministic in-memory engine for tests.
//!
//! Tokenizes on whitespace into a growing vocabulary, and for every sequence
//! replays the same script of words from the start, one per sample. Once the
//! script runs out it samples the end-of-generation token.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::batch::TokenBatch;
use crate::engine::{ChainStage, Engine};
use crate::error::EngineError;
use crate::token::{SeqId, Token};

pub(crate) const BOS: Token = 1;
pub(crate) const EOS: Token = 2;

/// Marker that makes the constraint compiler reject a pattern.
pub(crate) const REJECT_MARKER: &str = "<<reject>>";

/// Everything the engine was asked to do, shared with the test.
#[derive(Debug, Default)]
pub(crate) struct ProbeLog {
    pub(crate) sample_calls: usize,
    /// `(seq_id, n_tokens)` of every decode call, failed ones included.
    pub(crate) decodes: Vec<(SeqId, usize)>,
    /// Tokens accepted into constrained chains.
    pub(crate) accepted: Vec<Token>,
    /// Accept calls made against an unconstrained chain.
    pub(crate) unconstrained_accepts: usize,
    pub(crate) cleared: Vec<SeqId>,
    /// Patterns as the constraint compiler received them.
    pub(crate) compiled: Vec<String>,
    pub(crate) constrained_chains_built: usize,
    pub(crate) constrained_chains_dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Probe(Arc<Mutex<ProbeLog>>);

impl Probe {
    pub(crate) fn log(&self) -> MutexGuard<'_, ProbeLog> {
        self.0.lock().expect("probe lock")
    }
}

#[derive(Debug)]
pub(crate) struct MockConstraint {
    pattern: String,
}

#[derive(Debug)]
pub(crate) struct MockChain {
    constraint: Option<MockConstraint>,
    probe: Probe,
}

impl Drop for MockChain {
    fn drop(&mut self) {
        if self.constraint.is_some() {
            self.probe.log().constrained_chains_dropped += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    tokenize: bool,
    prompt_decode: bool,
    /// Fail single-token decodes once this many have succeeded.
    decode_after: Option<usize>,
    /// Fail token-to-piece for this word.
    piece_for: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ScriptedEngine {
    words: Vec<String>,
    ids: HashMap<String, Token>,
    script: Vec<Token>,
    cursors: HashMap<SeqId, usize>,
    /// Sequences with logits from a decode since their last clear.
    ready: HashSet<SeqId>,
    single_decodes: usize,
    faults: Faults,
    probe: Probe,
}

impl ScriptedEngine {
    pub(crate) fn new(script: &[&str]) -> Self {
        let mut engine = Self {
            words: vec!["<unk>".into(), "<s>".into(), "</s>".into()],
            ids: HashMap::new(),
            script: Vec::new(),
            cursors: HashMap::new(),
            ready: HashSet::new(),
            single_decodes: 0,
            faults: Faults::default(),
            probe: Probe::default(),
        };
        let script = script.iter().map(|w| engine.intern(w)).collect();
        engine.script = script;
        engine
    }

    pub(crate) fn probe(&self) -> Probe {
        self.probe.clone()
    }

    pub(crate) fn failing_tokenize(mut self) -> Self {
        self.faults.tokenize = true;
        self
    }

    pub(crate) fn failing_prompt_decode(mut self) -> Self {
        self.faults.prompt_decode = true;
        self
    }

    pub(crate) fn failing_decode_after(mut self, successes: usize) -> Self {
        self.faults.decode_after = Some(successes);
        self
    }

    pub(crate) fn failing_piece_for(mut self, word: &str) -> Self {
        self.faults.piece_for = Some(word.to_owned());
        self
    }

    fn intern(&mut self, word: &str) -> Token {
        if word == "</s>" {
            return EOS;
        }
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = Token::try_from(self.words.len()).expect("vocabulary overflow");
        self.words.push(word.to_owned());
        self.ids.insert(word.to_owned(), id);
        id
    }
}

impl Engine for ScriptedEngine {
    type Constraint = MockConstraint;
    type Chain = MockChain;

    fn tokenize(&mut self, text: &str, add_special: bool) -> Result<Vec<Token>, EngineError> {
        if self.faults.tokenize {
            return Err(EngineError::TokenizeFailed(-1));
        }
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS);
        }
        for word in text.split_whitespace() {
            tokens.push(self.intern(word));
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token) -> Result<String, EngineError> {
        let word = usize::try_from(token)
            .ok()
            .and_then(|i| self.words.get(i))
            .ok_or(EngineError::TokenToPieceFailed(-1))?;
        if self.faults.piece_for.as_deref() == Some(word.as_str()) {
            return Err(EngineError::TokenToPieceFailed(-2));
        }
        Ok(format!(" {word}"))
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError> {
        let seq_id = batch.seq_ids(0)[0];
        self.probe.log().decodes.push((seq_id, batch.n_tokens()));

        if batch.n_tokens() == 1 {
            if self.faults.decode_after == Some(self.single_decodes) {
                return Err(EngineError::DecodeFailed(1));
            }
            self.single_decodes += 1;
        } else if self.faults.prompt_decode {
            return Err(EngineError::DecodeFailed(-3));
        }

        assert_eq!(batch.logits().last(), Some(&true), "last entry must request logits");
        self.ready.insert(seq_id);
        Ok(())
    }

    fn sample(&mut self, _chain: &mut MockChain, seq_id: SeqId) -> Token {
        assert!(
            self.ready.contains(&seq_id),
            "sampled sequence {seq_id} without logits"
        );
        self.probe.log().sample_calls += 1;
        let cursor = self.cursors.entry(seq_id).or_insert(0);
        let token = self.script.get(*cursor).copied().unwrap_or(EOS);
        *cursor += 1;
        token
    }

    fn accept(&mut self, chain: &mut MockChain, token: Token) {
        let mut log = self.probe.log();
        match &chain.constraint {
            Some(_) => log.accepted.push(token),
            None => log.unconstrained_accepts += 1,
        }
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOS
    }

    fn compile_constraint(
        &mut self,
        pattern: &str,
        _root: &str,
    ) -> Result<MockConstraint, EngineError> {
        self.probe.log().compiled.push(pattern.to_owned());
        if pattern.contains(REJECT_MARKER) {
            return Err(EngineError::ConstraintRejected("unsupported rule".into()));
        }
        Ok(MockConstraint {
            pattern: pattern.to_owned(),
        })
    }

    fn chain_from_stages(&mut self, stages: Vec<ChainStage<MockConstraint>>) -> MockChain {
        let mut constraint = None;
        let mut selected = false;
        for stage in stages {
            match stage {
                ChainStage::Constraint(c) => {
                    assert!(!selected, "constraint stage after selection");
                    assert!(!c.pattern.is_empty());
                    constraint = Some(c);
                }
                ChainStage::Selection(_) => selected = true,
            }
        }
        assert!(selected, "chain without a selection stage");
        if constraint.is_some() {
            self.probe.log().constrained_chains_built += 1;
        }
        MockChain {
            constraint,
            probe: self.probe.clone(),
        }
    }

    fn clear_sequence(&mut self, seq_id: SeqId) {
        self.probe.log().cleared.push(seq_id);
        self.cursors.remove(&seq_id);
        self.ready.remove(&seq_id);
    }
}
