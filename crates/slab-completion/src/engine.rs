use crate::batch::TokenBatch;
use crate::error::EngineError;
use crate::sampler::SelectionStage;
use crate::token::{SeqId, Token};

/// One stage of a sampler chain, in the order it is applied.
#[derive(Debug)]
pub enum ChainStage<C> {
    /// Token filter compiled from a grammar pattern.
    Constraint(C),
    /// Terminal policy that picks one token from the remaining candidates.
    Selection(SelectionStage),
}

/// The primitive interface of the external inference engine.
///
/// The session layer never looks inside the engine: it tokenizes, decodes
/// batches into per-session sequences, samples one token through an opaque
/// chain and converts tokens back to text. Every call is blocking and is
/// made while holding the service's engine lock, so implementations see a
/// strictly sequential stream of calls.
pub trait Engine: Send + 'static {
    /// A compiled grammar constraint.
    type Constraint: Send + 'static;

    /// A sampler chain built from [`ChainStage`]s. Dropping it frees it.
    type Chain: Send + 'static;

    /// Tokenize `text`, optionally adding the model's special prefix tokens.
    fn tokenize(&mut self, text: &str, add_special: bool) -> Result<Vec<Token>, EngineError>;

    /// Convert a single token to its text fragment.
    fn token_to_piece(&self, token: Token) -> Result<String, EngineError>;

    /// Decode a batch into the running context.
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError>;

    /// Sample the next token for `seq_id` from the logits of that sequence's
    /// most recent decode.
    fn sample(&mut self, chain: &mut Self::Chain, seq_id: SeqId) -> Token;

    /// Advance the chain's stateful stages (grammar position, penalties)
    /// past `token`.
    fn accept(&mut self, chain: &mut Self::Chain, token: Token);

    /// Returns `true` if `token` ends generation (EOS, EOT, ...).
    fn is_eog(&self, token: Token) -> bool;

    /// Compile a grammar pattern, starting at rule `root`.
    fn compile_constraint(
        &mut self,
        pattern: &str,
        root: &str,
    ) -> Result<Self::Constraint, EngineError>;

    /// Build a new chain applying `stages` in order.
    fn chain_from_stages(&mut self, stages: Vec<ChainStage<Self::Constraint>>) -> Self::Chain;

    /// Remove every cached position of `seq_id` from the running context.
    fn clear_sequence(&mut self, seq_id: SeqId);
}
