//! Async surface: token streams and the idle sweeper.
//!
//! Steps are blocking engine work, so both helpers drive the service from
//! `tokio::task::spawn_blocking` and only hand results across channels.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::CompletionError;
use crate::request::CompletionRequest;
use crate::service::CompletionService;
use crate::session::{FinishReason, SessionId};

/// A chunk of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A generated text fragment.
    Token(String),
    /// Generation finished. `finish_reason` is `None` if the session was
    /// cancelled or released from elsewhere.
    Done { finish_reason: Option<FinishReason> },
    /// Generation stopped with an error.
    Error(String),
}

/// Receiver side of a token stream.
pub type StreamHandle = mpsc::Receiver<StreamChunk>;

/// Start a session for `request` and stream its fragments.
///
/// Errors while starting are returned directly. Once streaming, the channel
/// ends with exactly one [`StreamChunk::Done`] or [`StreamChunk::Error`].
/// Dropping the receiver cancels the session; it is always released.
pub async fn generate_stream<E: Engine>(
    service: Arc<CompletionService<E>>,
    request: CompletionRequest,
) -> Result<StreamHandle, CompletionError> {
    let starter = Arc::clone(&service);
    let id = tokio::task::spawn_blocking(move || starter.start(&request))
        .await
        .map_err(|_| CompletionError::WorkerShutdown)??;

    let (tx, rx) = mpsc::channel(service.config().stream_buffer);
    tokio::task::spawn_blocking(move || pump(&service, id, &tx));
    Ok(rx)
}

fn pump<E: Engine>(service: &CompletionService<E>, id: SessionId, tx: &mpsc::Sender<StreamChunk>) {
    loop {
        let (chunk, last) = match service.step(id) {
            Ok(Some(output)) if output.is_final => (
                StreamChunk::Done {
                    finish_reason: output.finish_reason,
                },
                true,
            ),
            Ok(Some(output)) => (StreamChunk::Token(output.text), false),
            Ok(None) => (StreamChunk::Done { finish_reason: None }, true),
            Err(e) => (StreamChunk::Error(e.to_string()), true),
        };

        if tx.blocking_send(chunk).is_err() {
            debug!(session_id = %id, "stream receiver dropped, cancelling session");
            if let Err(e) = service.cancel(id) {
                warn!(session_id = %id, error = %e, "failed to cancel abandoned stream");
            }
            break;
        }
        if last {
            break;
        }
    }

    if let Err(e) = service.release(id) {
        warn!(session_id = %id, error = %e, "failed to release streamed session");
    }
}

/// Periodically release sessions idle for longer than the configured
/// `idle_timeout`. Returns `None` when the timeout is disabled.
///
/// The task holds only a weak reference and exits once the service has been
/// dropped.
pub fn spawn_idle_sweeper<E: Engine>(service: &Arc<CompletionService<E>>) -> Option<JoinHandle<()>> {
    let idle_timeout = service.config().idle_timeout?;
    let weak = Arc::downgrade(service);
    let period = (idle_timeout / 2).max(Duration::from_millis(10));
    info!(?idle_timeout, "idle sweeper started");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(service) = weak.upgrade() else {
                debug!("completion service dropped, idle sweeper exiting");
                break;
            };
            match tokio::task::spawn_blocking(move || service.sweep_idle(idle_timeout)).await {
                Ok(Ok(swept)) if !swept.is_empty() => {
                    info!(count = swept.len(), "idle sweep released sessions");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "idle sweep failed"),
                Err(e) => {
                    warn!(error = %e, "idle sweep task panicked, sweeper exiting");
                    break;
                }
            }
        }
    }))
}
