//! Service configuration, loaded from environment variables.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::sampler::{DistributionParams, SelectionStage};

/// Runtime configuration for a [`crate::CompletionService`].
///
/// Every field has a default so the service works without any environment
/// variables set.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    /// Token budget used when a request carries no `n_predict` (default: 10).
    pub default_n_predict: usize,

    /// Maximum number of live sessions, i.e. engine sequences (default: 16).
    pub max_sessions: usize,

    /// Selection stage of the default chain and of every grammar chain.
    pub selection: SelectionStage,

    /// Root rule name handed to the constraint compiler (default: `"root"`).
    pub grammar_root: String,

    /// Sessions idle for longer than this are released by the sweeper that
    /// [`crate::spawn_idle_sweeper`] starts. `None` disables the sweep.
    pub idle_timeout: Option<Duration>,

    /// Capacity of the channel behind [`crate::generate_stream`].
    pub stream_buffer: usize,

    /// `tracing` filter string, e.g. `"info"` or `"slab_completion=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            default_n_predict: 10,
            max_sessions: 16,
            selection: SelectionStage::Greedy,
            grammar_root: "root".to_owned(),
            idle_timeout: None,
            stream_buffer: 64,
            log_level: "info".to_owned(),
            log_json: false,
        }
    }
}

impl CompletionConfig {
    /// Build [`CompletionConfig`] from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`CompletionConfig`] from an arbitrary key lookup.
    ///
    /// Values that fail to parse fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let vars = Vars(&lookup);

        let selection = match vars.get("SLAB_COMPLETION_SAMPLER").as_deref() {
            Some("dist") | Some("distribution") => {
                let base = DistributionParams::default();
                SelectionStage::Distribution(DistributionParams {
                    temperature: vars.parse("SLAB_COMPLETION_TEMPERATURE", base.temperature),
                    top_k: vars.parse("SLAB_COMPLETION_TOP_K", base.top_k),
                    top_p: vars.parse("SLAB_COMPLETION_TOP_P", base.top_p),
                    min_p: vars.parse("SLAB_COMPLETION_MIN_P", base.min_p),
                    seed: vars.parse("SLAB_COMPLETION_SEED", base.seed),
                })
            }
            _ => SelectionStage::Greedy,
        };

        let idle_secs: u64 = vars.parse("SLAB_COMPLETION_IDLE_TIMEOUT_SECS", 0);

        Self {
            default_n_predict: vars.parse("SLAB_COMPLETION_N_PREDICT", defaults.default_n_predict),
            max_sessions: vars.parse("SLAB_COMPLETION_MAX_SESSIONS", defaults.max_sessions),
            selection,
            grammar_root: vars.or("SLAB_COMPLETION_GRAMMAR_ROOT", &defaults.grammar_root),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            stream_buffer: vars
                .parse("SLAB_COMPLETION_STREAM_BUFFER", defaults.stream_buffer)
                .max(1),
            log_level: vars.or("SLAB_LOG", &defaults.log_level),
            log_json: vars
                .get("SLAB_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Install a global `tracing` subscriber configured from `config`.
///
/// `RUST_LOG` takes precedence over `log_level`. Calling this more than once,
/// or after the host installed its own subscriber, is a no-op.
pub fn init_tracing(config: &CompletionConfig) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match config.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SLAB_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    config.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    // An error only means a global subscriber is already set.
    let _ = if config.log_json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}
