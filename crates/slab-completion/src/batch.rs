use crate::error::CompletionError;
use crate::token::{Pos, SeqId, Token};

/// An owned batch of tokens handed to [`crate::Engine::decode`].
///
/// Use [`TokenBatch::new`] to create a batch, [`TokenBatch::add`] to add
/// tokens, and [`TokenBatch::clear`] to reset it for reuse. The engine only
/// ever sees the batch through shared slices, so nothing it does can outlive
/// or resize the buffers.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    tokens: Vec<Token>,
    positions: Vec<Pos>,
    seq_ids: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
    capacity: usize,
}

impl TokenBatch {
    /// Create a new batch with the given maximum token capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Build the prompt batch for one sequence: positions `0..len`, logits
    /// requested for the final token only.
    pub fn prompt(tokens: &[Token], seq_id: SeqId) -> Result<Self, CompletionError> {
        let mut batch = Self::new(tokens.len());
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            let pos = Pos::try_from(i).map_err(|_| CompletionError::InvalidRequest {
                reason: format!("prompt of {} tokens exceeds the position range", tokens.len()),
            })?;
            batch.add(token, pos, &[seq_id], i == last)?;
        }
        Ok(batch)
    }

    /// Build a one-token batch that advances `seq_id` by a single position.
    pub fn single(token: Token, pos: Pos, seq_id: SeqId) -> Self {
        Self {
            tokens: vec![token],
            positions: vec![pos],
            seq_ids: vec![vec![seq_id]],
            logits: vec![true],
            capacity: 1,
        }
    }

    /// Number of tokens currently in the batch.
    pub fn n_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Returns the maximum number of tokens this batch can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a single token to the batch.
    ///
    /// # Errors
    /// Returns [`CompletionError::BatchFull`] if the batch is at capacity.
    pub fn add(
        &mut self,
        token: Token,
        pos: Pos,
        seq_ids: &[SeqId],
        logit: bool,
    ) -> Result<(), CompletionError> {
        if self.tokens.len() >= self.capacity {
            return Err(CompletionError::BatchFull {
                capacity: self.capacity,
            });
        }

        self.tokens.push(token);
        self.positions.push(pos);
        self.seq_ids.push(seq_ids.to_vec());
        self.logits.push(logit);

        Ok(())
    }

    /// Clear all tokens from the batch, allowing it to be reused.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.seq_ids.clear();
        self.logits.clear();
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn positions(&self) -> &[Pos] {
        &self.positions
    }

    /// Sequence ids of the `i`-th entry.
    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        self.seq_ids.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Per-entry "compute logits" flags.
    pub fn logits(&self) -> &[bool] {
        &self.logits
    }
}
