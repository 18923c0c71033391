//! Remote session boundary
//!
//! The pipeline treats the AI backend as an opaque bidirectional stream
//! of typed messages. Transient-vs-fatal classification happens here at
//! the boundary, via `RemoteError::is_transient`; callers never inspect
//! error message text.

use crate::events::{MediaChunk, Transcript};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Initial handshake failure; retried by the controller's connect
    /// policy, fatal once retries are exhausted.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Timeout-class fault during send/receive; the task retries in
    /// place after a short delay.
    #[error("transient remote fault: {0}")]
    Transient(String),

    #[error("remote session closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Typed message received from the remote.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Synthesized audio payload (raw PCM at the receive sample rate).
    Audio(Vec<u8>),
    /// Transcription of model speech for the current turn.
    Transcription(Transcript),
    /// The model finished generating the current turn.
    TurnComplete,
    /// The server asked us to disconnect.
    GoAway,
}

/// A live bidirectional session. The transport supports concurrent
/// independent send and receive (split sink/stream underneath), so one
/// task may send while another receives.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn send(&self, chunk: MediaChunk) -> Result<(), RemoteError>;

    /// Next server event; `None` once the stream has ended cleanly.
    async fn receive(&self) -> Option<Result<ServerEvent, RemoteError>>;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Connection factory, one connect attempt per call. The controller's
/// retry policy lives above this seam.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}
