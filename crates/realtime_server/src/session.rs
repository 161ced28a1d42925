use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use realtime_core::{Envelope, RealtimeError, SessionId, UserId, WireFormat};
use tokio::sync::mpsc;

/// `open -> closing -> closed`, matching spec §4.A. Stored as an atomic so
/// `status()` can be read without taking any lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closing,
    Closed,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// What the session's single writer task drains from the outbound queue.
#[derive(Debug)]
pub enum OutboundFrame {
    Bytes(Vec<u8>),
    Close(String),
}

/// One live client connection. Owned by the Session Registry for its
/// lifetime; the session exclusively owns its outbound queue and no other
/// component reads it -- the paired `mpsc::Receiver` returned by `new` is
/// handed to exactly one writer task (the gateway's per-connection send
/// loop in `realtime_gateway`).
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub vars: HashMap<String, String>,
    pub expiry: Option<SystemTime>,
    pub format: WireFormat,
    status: AtomicU8,
    outbound_tx: mpsc::Sender<OutboundFrame>,
}

impl Session {
    pub fn new(
        id: SessionId,
        user_id: UserId,
        username: String,
        format: WireFormat,
        expiry: Option<SystemTime>,
        outbound_queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(outbound_queue_size.max(1));
        let session = Self {
            id,
            user_id,
            username,
            vars: HashMap::new(),
            expiry,
            format,
            status: AtomicU8::new(0),
            outbound_tx: tx,
        };
        (Arc::new(session), rx)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Enqueue an envelope for the writer. Non-blocking: a full queue fails
    /// immediately with `resource-exhausted` rather than waiting, per the
    /// session's suspension-point contract in spec §4.A.
    pub fn send(&self, envelope: &Envelope) -> Result<(), RealtimeError> {
        let bytes = envelope.encode(self.format)?;
        self.send_bytes(bytes)
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), RealtimeError> {
        if self.status() != SessionStatus::Open {
            return Err(RealtimeError::unavailable("session is closing"));
        }
        self.outbound_tx
            .try_send(OutboundFrame::Bytes(bytes))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RealtimeError::resource_exhausted("queue-full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    RealtimeError::unavailable("session writer gone")
                }
            })
    }

    /// Idempotent. Transitions `open -> closing`, asks the writer to drain
    /// and hard-close once the deadline in spec §4.A passes. A session
    /// already `closing` or `closed` is a no-op.
    pub fn close(&self, reason: impl Into<String>) {
        if self
            .status
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reason = reason.into();
        tracing::info!(session_id = %self.id, user_id = %self.user_id, reason = %reason, "session closing");
        let _ = self.outbound_tx.try_send(OutboundFrame::Close(reason));
    }

    /// Called by the writer task once the transport is actually torn down.
    pub fn mark_closed(&self) {
        self.status.store(2, Ordering::Release);
    }
}
