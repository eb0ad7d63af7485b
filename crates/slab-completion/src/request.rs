use serde::{Deserialize, Serialize};

use crate::error::CompletionError;
use crate::session::FinishReason;

/// A request to generate text for one prompt.
///
/// Hosts usually hand this over as JSON, e.g.
/// `{"prompt": "The sky is", "n_predict": 3, "grammar": "root ::= [a-z]+"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Maximum number of tokens to generate. Falls back to the service's
    /// configured default when absent.
    #[serde(default)]
    pub n_predict: Option<usize>,
    /// Grammar pattern constraining the output. An empty string means none.
    #[serde(default)]
    pub grammar: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            n_predict: None,
            grammar: None,
        }
    }

    pub fn with_max_tokens(mut self, n_predict: usize) -> Self {
        self.n_predict = Some(n_predict);
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    /// Parse a JSON request.
    ///
    /// # Errors
    /// Returns [`CompletionError::InvalidRequest`] for malformed JSON or an
    /// empty prompt.
    pub fn from_json(params: &str) -> Result<Self, CompletionError> {
        let request: Self =
            serde_json::from_str(params).map_err(|e| CompletionError::InvalidRequest {
                reason: e.to_string(),
            })?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), CompletionError> {
        if self.prompt.is_empty() {
            return Err(CompletionError::InvalidRequest {
                reason: "prompt must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// The grammar pattern, if one was supplied and is non-empty.
    pub fn grammar(&self) -> Option<&str> {
        self.grammar.as_deref().filter(|g| !g.is_empty())
    }
}

/// One increment returned by a step.
///
/// Intermediate outputs carry only the newest token's text; the final output
/// carries the full accumulated text of the session (callers that
/// concatenate the intermediate fragments end up with exactly that text).
///
/// The final text is cumulative on both paths: after an end-of-generation
/// token (`Stop`) and when the token budget runs out (`Length`), where no
/// new fragment is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutput {
    pub text: String,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl StepOutput {
    pub(crate) fn fragment(text: String) -> Self {
        Self {
            text,
            is_final: false,
            finish_reason: None,
        }
    }

    pub(crate) fn finished(text: String, reason: FinishReason) -> Self {
        Self {
            text,
            is_final: true,
            finish_reason: Some(reason),
        }
    }
}
