use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::endpoint::StreamHostMessage;
use crate::signal::SignalMessage;

/// Everything the signaling channel carries for one negotiation:
/// session signaling plus the stream-host advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Signal(SignalMessage),
    StreamHost(StreamHostMessage),
}

impl ChannelMessage {
    /// Channel-level address of the intended recipient.
    #[must_use]
    pub fn recipient(&self) -> &str {
        match self {
            Self::Signal(m) => &m.to,
            Self::StreamHost(m) => &m.to,
        }
    }

    /// Channel-level address of the sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        match self {
            Self::Signal(m) => &m.from,
            Self::StreamHost(m) => &m.from,
        }
    }

    /// Correlation token scoping this message to one session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Signal(m) => &m.session_id,
            Self::StreamHost(m) => &m.session_id,
        }
    }
}

/// A handle to the external messaging transport.
///
/// The channel is shared by the session manager and every live session;
/// none of them owns its lifecycle and none of them may close it. Inbound
/// traffic arrives on the queue handed out when the endpoint was created,
/// so dispatch is plain message passing and never re-enters the transport.
pub trait SignalChannel: Send + Sync + 'static {
    /// The address other parties use to reach this endpoint.
    fn local_address(&self) -> String;

    /// Delivers `msg` to `msg.recipient()`.
    fn send(&self, msg: ChannelMessage) -> impl Future<Output = Result<()>> + Send + '_;
}

type RouteTable = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>;

/// In-process switchboard routing channel messages by recipient address.
///
/// Stands in for the real messaging transport in tests and the loopback
/// demo. Messages still cross a serialization boundary (JSON bytes) so
/// anything that would not survive the wire fails here too.
#[derive(Clone, Default)]
pub struct MemoryChannelHub {
    routes: RouteTable,
}

impl MemoryChannelHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` on the hub and returns the endpoint together
    /// with its inbound message queue.
    ///
    /// Registering the same address twice replaces the previous route;
    /// the old queue stops receiving.
    #[must_use]
    pub fn endpoint(&self, address: &str) -> (MemoryChannel, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel::<ChannelMessage>();

        self.routes
            .lock()
            .expect("channel route table poisoned")
            .insert(address.to_string(), raw_tx);

        let addr = address.to_string();
        tokio::spawn(async move {
            while let Some(bytes) = raw_rx.recv().await {
                match serde_json::from_slice::<ChannelMessage>(&bytes) {
                    Ok(msg) => {
                        if msg_tx.send(msg).is_err() {
                            debug!(address = %addr, "Inbound queue dropped, stopping delivery");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(address = %addr, error = %e, "Discarding undecodable channel message");
                    }
                }
            }
        });

        (
            MemoryChannel {
                address: address.to_string(),
                routes: Arc::clone(&self.routes),
            },
            msg_rx,
        )
    }
}

/// One endpoint on a [`MemoryChannelHub`].
#[derive(Clone)]
pub struct MemoryChannel {
    address: String,
    routes: RouteTable,
}

impl SignalChannel for MemoryChannel {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    fn send(&self, msg: ChannelMessage) -> impl Future<Output = Result<()>> + Send + '_ {
        async move {
            let bytes = serde_json::to_vec(&msg).context("failed to encode channel message")?;
            let recipient = msg.recipient().to_string();

            let route = self
                .routes
                .lock()
                .expect("channel route table poisoned")
                .get(&recipient)
                .cloned();

            let Some(route) = route else {
                bail!("no route to {recipient}");
            };
            if route.send(bytes).is_err() {
                bail!("endpoint {recipient} is gone");
            }
            Ok(())
        }
    }
}
