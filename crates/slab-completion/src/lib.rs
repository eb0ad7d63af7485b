//! Incremental, cancellable text generation over an external inference
//! engine.
//!
//! A [`CompletionService`] turns one "generate text for this prompt" request
//! into a session that the caller advances one token at a time:
//!
//! ```rust,ignore
//! use slab_completion::{CompletionConfig, CompletionRequest, CompletionService};
//!
//! let service = CompletionService::new(engine, CompletionConfig::from_env());
//! let id = service.start(&CompletionRequest::new("The sky is").with_max_tokens(3))?;
//! while let Some(output) = service.step(id)? {
//!     if output.is_final {
//!         println!("full text: {}", output.text);
//!         break;
//!     }
//!     print!("{}", output.text);
//! }
//! service.release(id)?;
//! ```
//!
//! The engine is reached only through the [`Engine`] trait. Grammar patterns
//! are rewritten by [`grammar::preprocess`] before they reach the engine's
//! constraint compiler.

mod batch;
mod config;
mod engine;
mod error;
pub mod grammar;
mod registry;
mod request;
mod sampler;
mod service;
mod session;
mod stream;
mod token;

#[cfg(test)]
mod mock;

pub use batch::TokenBatch;
pub use config::{CompletionConfig, init_tracing};
pub use engine::{ChainStage, Engine};
pub use error::{CompletionError, EngineError};
pub use request::{CompletionRequest, StepOutput};
pub use sampler::{DEFAULT_SEED, DistributionParams, SelectionStage};
pub use service::{CompletionService, Generation};
pub use session::{FinishReason, SessionId, SessionInfo, TaskState};
pub use stream::{StreamChunk, StreamHandle, generate_stream, spawn_idle_sweeper};
pub use token::{Pos, SeqId, Token};
