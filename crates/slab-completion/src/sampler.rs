use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::{ChainStage, Engine};
use crate::error::CompletionError;
use crate::grammar;

/// The default seed value for distribution sampling (non-deterministic).
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Parameters of the stochastic selection stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DistributionParams {
    /// Temperature (default 0.8).
    pub temperature: f32,
    /// Top-K (default 40, 0 = disabled).
    pub top_k: i32,
    /// Top-P (default 0.9, 1.0 = disabled).
    pub top_p: f32,
    /// Min-P (default 0.05, 0.0 = disabled).
    pub min_p: f32,
    /// Random seed (default [`DEFAULT_SEED`]).
    pub seed: u32,
}

impl Default for DistributionParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.05,
            seed: DEFAULT_SEED,
        }
    }
}

/// The terminal stage of every chain: how one token is picked.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionStage {
    /// Argmax over the candidates.
    #[default]
    Greedy,
    /// Seeded sampling from the (filtered) distribution.
    Distribution(DistributionParams),
}

/// The chain a session samples with.
#[derive(Debug)]
pub(crate) enum ChainSlot<C> {
    /// The service-wide default chain. Never accepted into, never owned.
    Shared,
    /// A private `[constraint, selection]` chain, freed when the slot drops.
    Owned(C),
}

impl<C> ChainSlot<C> {
    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, ChainSlot::Owned(_))
    }
}

/// Build the service-wide default chain: the selection stage alone.
pub(crate) fn default_chain<E: Engine>(engine: &mut E, selection: &SelectionStage) -> E::Chain {
    engine.chain_from_stages(vec![ChainStage::Selection(selection.clone())])
}

/// Resolve the chain for a new session.
///
/// Without a grammar the session shares the default chain. With one, the
/// pattern is preprocessed and compiled; a compile failure fails the whole
/// request rather than silently dropping the constraint.
pub(crate) fn build_chain<E: Engine>(
    engine: &mut E,
    grammar_pattern: Option<&str>,
    root: &str,
    selection: &SelectionStage,
) -> Result<ChainSlot<E::Chain>, CompletionError> {
    let Some(pattern) = grammar_pattern else {
        return Ok(ChainSlot::Shared);
    };

    let processed = grammar::preprocess(pattern);
    debug!(original = pattern, processed = %processed, "preprocessed grammar pattern");

    let constraint = engine.compile_constraint(&processed, root).map_err(|source| {
        warn!(pattern, error = %source, "grammar rejected by constraint compiler");
        CompletionError::GrammarCompileFailed {
            pattern: pattern.to_owned(),
            source,
        }
    })?;

    let chain = engine.chain_from_stages(vec![
        ChainStage::Constraint(constraint),
        ChainStage::Selection(selection.clone()),
    ]);
    Ok(ChainSlot::Owned(chain))
}
