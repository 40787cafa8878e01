use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

use airlift_core::endpoint::StreamEndpoint;
use airlift_core::signal::new_session_id;

/// Default chunk size for the streaming file copy.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle states shared by both session directions.
///
/// `Terminated` is absorbing: a terminated session discards all further
/// signaling. `Connecting` is only reached by the incoming side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Offered,
    Accepted,
    Connecting,
    Transferring,
    Terminated,
}

/// Opaque correlation token scoping all signaling for one transfer.
///
/// Generated by the initiator and never changed after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh id (initiator side).
    #[must_use]
    pub fn generate() -> Self {
        Self(new_session_id())
    }

    /// Wraps an id received over the wire (responder side).
    #[must_use]
    pub fn from_wire(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session knobs.
///
/// The defaults reproduce the original protocol behavior: an offer with no
/// answer waits forever, and a digest mismatch is reported but does not
/// fail the transfer.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How long an outgoing offer may sit unanswered before the session
    /// gives up. `None` waits indefinitely.
    pub negotiation_timeout: Option<Duration>,
    /// Whether the receiver compares the transferred bytes against the
    /// digest declared in the offer. The comparison is advisory either
    /// way; the bytes are delivered regardless.
    pub verify_digest: bool,
    /// Chunk size for the streaming copy on both sides.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: None,
            verify_digest: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Commands a caller can send into a running session.
#[derive(Debug, Clone, Copy)]
pub enum SessionCmd {
    /// Release all resources and end the session. Safe to send at any
    /// state and any number of times.
    Terminate,
}

/// Events emitted by a session for its observer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The offer went out (outgoing side).
    Offered,
    /// The peer accepted, or the local side sent its accept.
    Accepted,
    /// The peer declined the offer before any socket was opened.
    Declined,
    /// The stream-host advertisement went out (outgoing side).
    EndpointSent { endpoint: StreamEndpoint },
    /// The stream-host advertisement arrived (incoming side).
    EndpointReceived { endpoint: StreamEndpoint },
    /// Bytes moved so far.
    TransferProgress { bytes: u64 },
    /// The full byte count moved. `digest_ok` is `None` unless digest
    /// verification was enabled in [`SessionConfig`].
    TransferComplete { bytes: u64, digest_ok: Option<bool> },
    /// The peer closed the data connection early; a normal way for a
    /// transfer to end, not a hard failure.
    PeerClosed,
    /// Negotiation or transport setup failed, or the byte stream ended
    /// short of the declared size.
    Failed { message: String },
    /// The session released its resources; always the last event.
    Terminated,
}

/// Handle returned when a session is spawned. Lets the caller send
/// commands and observe session events.
pub struct SessionHandle {
    pub id: SessionId,
    pub cmd_tx: mpsc::Sender<SessionCmd>,
    pub event_rx: mpsc::Receiver<SessionEvent>,
}

impl SessionHandle {
    /// Asks the session to terminate. A no-op once the session is gone,
    /// so calling this repeatedly is safe.
    pub async fn terminate(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Terminate).await;
    }

    /// Waits for the next session event. `None` once the session task
    /// has stopped and drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }
}
