use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use airlift_core::channel::{ChannelMessage, SignalChannel};
use airlift_core::endpoint::{StreamEndpoint, StreamHostMessage};
use airlift_core::net;
use airlift_core::signal::{self, FileOffer, SignalAction, SignalMessage};

use crate::manager::Registry;
use crate::session::{SessionCmd, SessionConfig, SessionEvent, SessionHandle, SessionId, SessionState};
use crate::tcp::{self, SendOutcome};

/// Sender side of a negotiated transfer.
///
/// Spawning sends the offer and registers the session for signaling
/// bearing its id; everything after that happens on the session's own
/// task so blocking socket work never starves signaling dispatch.
pub(crate) struct OutgoingSession;

impl OutgoingSession {
    pub(crate) async fn spawn<C: SignalChannel>(
        channel: Arc<C>,
        registry: Registry,
        responder: String,
        path: PathBuf,
        config: SessionConfig,
    ) -> Result<SessionHandle> {
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("cannot offer {}", path.display()))?;
        ensure!(meta.is_file(), "{} is not a regular file", path.display());

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();
        let digest = signal::file_sha256_hex(&path).await?;
        let offer = FileOffer::new(name, meta.len(), digest)?;

        let id = SessionId::generate();
        let initiator = channel.local_address();

        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        registry.insert(&id, sig_tx)?;

        let offer_msg = SignalMessage::offer(&initiator, &responder, id.as_str(), offer);
        if let Err(e) = channel.send(ChannelMessage::Signal(offer_msg)).await {
            registry.remove(&id);
            return Err(e.context("failed to send offer"));
        }
        info!(session_id = %id, responder = %responder, "Offer sent");

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(run_outgoing(
            channel,
            registry,
            id.clone(),
            initiator,
            responder,
            path,
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
async fn run_outgoing<C: SignalChannel>(
    channel: Arc<C>,
    registry: Registry,
    id: SessionId,
    initiator: String,
    responder: String,
    path: PathBuf,
    config: SessionConfig,
    mut sig_rx: mpsc::UnboundedReceiver<ChannelMessage>,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut state = SessionState::Offered;
    let _ = event_tx.send(SessionEvent::Offered).await;

    let mut transfer: Option<JoinHandle<Result<SendOutcome>>> = None;
    let mut cmd_open = true;
    let deadline = config
        .negotiation_timeout
        .map(|d| tokio::time::Instant::now() + d);

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv(), if cmd_open => {
                match cmd {
                    Some(SessionCmd::Terminate) => {
                        info!(session_id = %id, "Local terminate");
                        if let Some(t) = transfer.take() {
                            // Dropping the aborted task closes the listener
                            // and socket, unblocking any pending accept/write.
                            t.abort();
                        }
                        let bye = SignalMessage::terminate(
                            &initiator, &responder, &initiator, &responder, id.as_str(),
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
                    // Dispatcher gone; nothing more can arrive.
                    if let Some(t) = transfer.take() {
                        t.abort();
                    }
                    break;
                };
                match msg {
                    ChannelMessage::Signal(sig) => match (sig.action, state) {
                        (SignalAction::Accept, SessionState::Offered) => {
                            info!(session_id = %id, "Offer accepted");
                            let _ = event_tx.send(SessionEvent::Accepted).await;
                            match open_stream_host().await {
                                Ok((listener, endpoint)) => {
                                    let advert = StreamHostMessage {
                                        from: initiator.clone(),
                                        to: responder.clone(),
                                        session_id: id.as_str().to_string(),
                                        endpoint: endpoint.clone(),
                                    };
                                    if let Err(e) = channel.send(ChannelMessage::StreamHost(advert)).await {
                                        warn!(session_id = %id, error = %e, "Failed to advertise stream host");
                                        let _ = event_tx.send(SessionEvent::Failed {
                                            message: format!("failed to advertise stream host: {e}"),
                                        }).await;
                                        break;
                                    }
                                    info!(session_id = %id, endpoint = %endpoint, "Stream host advertised");
                                    let _ = event_tx.send(SessionEvent::EndpointSent {
                                        endpoint,
                                    }).await;

                                    state = SessionState::Transferring;
                                    let progress_tx = event_tx.clone();
                                    let file = path.clone();
                                    let chunk = config.chunk_size;
                                    transfer = Some(tokio::spawn(async move {
                                        tcp::send_file(listener, &file, chunk, |bytes| {
                                            let _ = progress_tx.try_send(
                                                SessionEvent::TransferProgress { bytes },
                                            );
                                        })
                                        .await
                                    }));
                                }
                                Err(e) => {
                                    warn!(session_id = %id, error = %e, "Transport setup failed");
                                    let _ = event_tx.send(SessionEvent::Failed {
                                        message: format!("transport setup failed: {e}"),
                                    }).await;
                                    break;
                                }
                            }
                        }
                        (SignalAction::Terminate, SessionState::Offered) => {
                            info!(session_id = %id, "Offer declined by peer");
                            let _ = event_tx.send(SessionEvent::Declined).await;
                            break;
                        }
                        (SignalAction::Terminate, _) => {
                            info!(session_id = %id, "Peer terminated session");
                            if let Some(t) = transfer.take() {
                                t.abort();
                            }
                            break;
                        }
                        (action, state) => {
                            debug!(
                                session_id = %id,
                                action = ?action,
                                state = ?state,
                                "Discarding signaling in current state"
                            );
                        }
                    },
                    ChannelMessage::StreamHost(_) => {
                        debug!(session_id = %id, "Discarding unexpected stream host");
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
                    Ok(Ok(SendOutcome::Complete { bytes })) => {
                        let _ = event_tx.send(SessionEvent::TransferComplete {
                            bytes,
                            digest_ok: None,
                        }).await;
                    }
                    Ok(Ok(SendOutcome::PeerClosed { .. })) => {
                        let _ = event_tx.send(SessionEvent::PeerClosed).await;
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

            () = async {
                match deadline {
                    Some(t) => tokio::time::sleep_until(t).await,
                    None => std::future::pending().await,
                }
            }, if deadline.is_some() && state == SessionState::Offered => {
                warn!(session_id = %id, "Offer timed out");
                let _ = event_tx.send(SessionEvent::Failed {
                    message: "offer was not answered in time".into(),
                }).await;
                break;
            }
        }
    }

    // Teardown runs exactly once per session, whatever path got here.
    registry.remove(&id);
    let _ = event_tx.send(SessionEvent::Terminated).await;
    info!(session_id = %id, "Outgoing session terminated");
}

/// Allocates a free port and binds the passive socket the peer will
/// connect to. Failure here is fatal for the session.
async fn open_stream_host() -> Result<(TcpListener, StreamEndpoint)> {
    let host = net::resolve_local_address().context("failed to resolve local address")?;
    let port = net::allocate_free_port()?;
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind stream host on {host}:{port}"))?;
    Ok((listener, StreamEndpoint::direct_tcp(host.to_string(), port)))
}
