use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use airlift_core::channel::{ChannelMessage, SignalChannel};
use airlift_core::signal::{FileOffer, SignalAction, SignalMessage};

use crate::manager::Registry;
use crate::session::{SessionCmd, SessionConfig, SessionEvent, SessionHandle, SessionId, SessionState};
use crate::tcp::{self, ReceiveOutcome};

/// Receiver side of a negotiated transfer.
///
/// Spawned when a session request is accepted: registers for signaling,
/// sends the accept, then waits for the peer's stream host and pulls the
/// declared byte count off the wire.
pub(crate) struct IncomingSession;

impl IncomingSession {
    pub(crate) async fn spawn<C: SignalChannel>(
        channel: Arc<C>,
        registry: Registry,
        id: SessionId,
        initiator: String,
        offer: FileOffer,
        receive_dir: PathBuf,
        config: SessionConfig,
    ) -> Result<SessionHandle> {
        let responder = channel.local_address();

        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        registry.insert(&id, sig_tx)?;

        let accept = SignalMessage::accept(&initiator, &responder, id.as_str());
        if let Err(e) = channel.send(ChannelMessage::Signal(accept)).await {
            registry.remove(&id);
            return Err(e.context("failed to send accept"));
        }
        info!(session_id = %id, initiator = %initiator, "Offer accepted, accept sent");

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(run_incoming(
            channel,
            registry,
            id.clone(),
            initiator,
            responder,
            offer,
            receive_dir,
            config,
            sig_rx,
            cmd_rx,
            event_tx,
        ));

        Ok(SessionHandle {
            id,
            cmd_tx,
            event_rx,
        })
    }
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
async fn run_incoming<C: SignalChannel>(
    channel: Arc<C>,
    registry: Registry,
    id: SessionId,
    initiator: String,
    responder: String,
    offer: FileOffer,
    receive_dir: PathBuf,
    config: SessionConfig,
    mut sig_rx: mpsc::UnboundedReceiver<ChannelMessage>,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut state = SessionState::Accepted;
    let _ = event_tx.send(SessionEvent::Accepted).await;

    let mut transfer: Option<JoinHandle<Result<ReceiveOutcome>>> = None;
    let mut cmd_open = true;

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv(), if cmd_open => {
                match cmd {
                    Some(SessionCmd::Terminate) => {
                        info!(session_id = %id, "Local terminate");
                        if let Some(t) = transfer.take() {
                            t.abort();
                        }
                        let bye = SignalMessage::terminate(
                            &responder, &initiator, &initiator, &responder, id.as_str(),
                        );
                        if let Err(e) = channel.send(ChannelMessage::Signal(bye)).await {
                            debug!(session_id = %id, error = %e, "Failed to send terminate");
                        }
                        break;
                    }
                    None => cmd_open = false,
                }
            }

            msg = sig_rx.recv() => {
                let Some(msg) = msg else {
                    if let Some(t) = transfer.take() {
                        t.abort();
                    }
                    break;
                };
                match msg {
                    ChannelMessage::StreamHost(advert) if state == SessionState::Accepted => {
                        info!(
                            session_id = %id,
                            endpoint = %advert.endpoint,
                            "Stream host received, connecting"
                        );
                        // The spawned task carries both the connect and the
                        // byte stream; the actor stays responsive to
                        // terminate signaling throughout.
                        state = SessionState::Connecting;
                        let _ = event_tx.send(SessionEvent::EndpointReceived {
                            endpoint: advert.endpoint.clone(),
                        }).await;

                        let progress_tx = event_tx.clone();
                        let size = offer.size;
                        let name = offer.name.clone();
                        let dir = receive_dir.clone();
                        let chunk = config.chunk_size;
                        transfer = Some(tokio::spawn(async move {
                            tcp::receive_file(&advert.endpoint, size, &dir, &name, chunk, |bytes| {
                                let _ = progress_tx.try_send(
                                    SessionEvent::TransferProgress { bytes },
                                );
                            })
                            .await
                        }));
                    }
                    ChannelMessage::Signal(sig) if sig.action == SignalAction::Terminate => {
                        info!(session_id = %id, "Peer terminated session");
                        if let Some(t) = transfer.take() {
                            t.abort();
                        }
                        break;
                    }
                    other => {
                        debug!(
                            session_id = %id,
                            state = ?state,
                            from = %other.sender(),
                            "Discarding signaling in current state"
                        );
                    }
                }
            }

            result = async {
                match transfer.as_mut() {
                    Some(t) => t.await,
                    None => std::future::pending().await,
                }
            }, if transfer.is_some() => {
                transfer = None;
                match result {
                    Ok(Ok(ReceiveOutcome::Complete { bytes, digest, path })) => {
                        let digest_ok = config.verify_digest.then(|| {
                            let ok = digest == offer.digest;
                            if !ok {
                                warn!(
                                    session_id = %id,
                                    path = %path.display(),
                                    expected = %offer.digest,
                                    actual = %digest,
                                    "Digest mismatch on received file"
                                );
                            }
                            ok
                        });
                        let _ = event_tx.send(SessionEvent::TransferComplete {
                            bytes,
                            digest_ok,
                        }).await;
                    }
                    Ok(Ok(ReceiveOutcome::Incomplete { bytes })) => {
                        let _ = event_tx.send(SessionEvent::Failed {
                            message: format!(
                                "connection dropped after {bytes} of {} bytes",
                                offer.size
                            ),
                        }).await;
                    }
                    Ok(Err(e)) => {
                        warn!(session_id = %id, error = %e, "Transfer failed");
                        let _ = event_tx.send(SessionEvent::Failed {
                            message: e.to_string(),
                        }).await;
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Transfer task panicked");
                        let _ = event_tx.send(SessionEvent::Failed {
                            message: e.to_string(),
                        }).await;
                    }
                }
                break;
            }
        }
    }

    registry.remove(&id);
    let _ = event_tx.send(SessionEvent::Terminated).await;
    info!(session_id = %id, "Incoming session terminated");
}
