use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, ensure};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use airlift_core::channel::{ChannelMessage, SignalChannel};
use airlift_core::signal::{FileOffer, SignalAction, SignalMessage};

use crate::incoming::IncomingSession;
use crate::outgoing::OutgoingSession;
use crate::session::{SessionConfig, SessionHandle, SessionId};

/// Route table from session id to the owning session's signaling queue.
///
/// Mutated by session construction/termination and read by dispatch,
/// which run on independent tasks.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ChannelMessage>>>>,
}

impl Registry {
    /// Registers a live session. At most one entry may exist per id.
    pub(crate) fn insert(
        &self,
        id: &SessionId,
        tx: mpsc::UnboundedSender<ChannelMessage>,
    ) -> Result<()> {
        let mut map = self.inner.lock().expect("session registry poisoned");
        ensure!(
            !map.contains_key(id.as_str()),
            "session {id} is already registered"
        );
        map.insert(id.as_str().to_string(), tx);
        Ok(())
    }

    pub(crate) fn remove(&self, id: &SessionId) {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .remove(id.as_str());
    }

    fn route(&self, session_id: &str) -> Option<mpsc::UnboundedSender<ChannelMessage>> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .get(session_id)
            .cloned()
    }
}

/// Token identifying one registered session-request listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// An unmatched offer surfaced to session-request listeners.
///
/// Every registered listener sees every unmatched offer; the first
/// listener to call [`accept`](SessionRequest::accept) or
/// [`decline`](SessionRequest::decline) decides, later calls are no-ops.
pub struct SessionRequest<C: SignalChannel> {
    from: String,
    initiator: String,
    offer: FileOffer,
    session_id: SessionId,
    channel: Arc<C>,
    registry: Registry,
    config: SessionConfig,
    decided: Arc<Mutex<bool>>,
}

// Manual impl: `C` itself is behind an Arc and need not be Clone.
impl<C: SignalChannel> Clone for SessionRequest<C> {
    fn clone(&self) -> Self {
        Self {
            from: self.from.clone(),
            initiator: self.initiator.clone(),
            offer: self.offer.clone(),
            session_id: self.session_id.clone(),
            channel: Arc::clone(&self.channel),
            registry: self.registry.clone(),
            config: self.config.clone(),
            decided: Arc::clone(&self.decided),
        }
    }
}

impl<C: SignalChannel> SessionRequest<C> {
    /// Channel address the offer came from.
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// The offered file's metadata.
    #[must_use]
    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Claims the decision for this request. Only the first caller wins.
    fn claim(&self) -> bool {
        let mut decided = self.decided.lock().expect("request decision poisoned");
        !std::mem::replace(&mut *decided, true)
    }

    /// Accepts the offer: spawns the incoming session (which sends the
    /// accept message) and returns its handle. Returns `Ok(None)` when
    /// the request was already decided.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be registered or the
    /// accept message cannot be sent.
    pub async fn accept(&self, receive_dir: impl Into<PathBuf>) -> Result<Option<SessionHandle>> {
        if !self.claim() {
            debug!(session_id = %self.session_id, "Request already decided");
            return Ok(None);
        }
        let handle = IncomingSession::spawn(
            Arc::clone(&self.channel),
            self.registry.clone(),
            self.session_id.clone(),
            self.initiator.clone(),
            self.offer.clone(),
            receive_dir.into(),
            self.config.clone(),
        )
        .await?;
        Ok(Some(handle))
    }

    /// Declines the offer: sends a terminate and never opens a socket.
    /// A no-op when the request was already decided.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminate message cannot be sent.
    pub async fn decline(&self) -> Result<()> {
        if !self.claim() {
            debug!(session_id = %self.session_id, "Request already decided");
            return Ok(());
        }
        let responder = self.channel.local_address();
        let bye = SignalMessage::terminate(
            &responder,
            &self.initiator,
            &self.initiator,
            &responder,
            self.session_id.as_str(),
        );
        self.channel.send(ChannelMessage::Signal(bye)).await?;
        info!(session_id = %self.session_id, "Offer declined");
        Ok(())
    }
}

/// Shared dispatcher between the messaging channel and all live sessions.
///
/// Drains the channel's inbound queue on its own task: traffic for a
/// registered session id is forwarded to that session, unmatched offers
/// become [`SessionRequest`]s for the registered listeners, everything
/// else is discarded. Malformed or unknown traffic never brings the
/// dispatcher down.
pub struct SessionManager<C: SignalChannel> {
    channel: Arc<C>,
    registry: Registry,
    listeners: Mutex<Vec<(ListenerId, mpsc::UnboundedSender<SessionRequest<C>>)>>,
    next_listener: AtomicU64,
    config: SessionConfig,
}

impl<C: SignalChannel> SessionManager<C> {
    /// Starts the manager and its dispatch task over the channel's
    /// inbound queue.
    #[must_use]
    pub fn start(
        channel: Arc<C>,
        inbound: mpsc::UnboundedReceiver<ChannelMessage>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            channel,
            registry: Registry::default(),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            config,
        });
        tokio::spawn(dispatch(Arc::clone(&manager), inbound));
        manager
    }

    /// Registers a listener for unmatched offers and returns its queue.
    #[must_use]
    pub fn add_session_request_listener(
        &self,
    ) -> (ListenerId, mpsc::UnboundedReceiver<SessionRequest<C>>) {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .push((id, tx));
        (id, rx)
    }

    /// Removes a previously registered listener. Unknown ids are ignored.
    pub fn remove_session_request_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .retain(|(lid, _)| *lid != id);
    }

    /// Offers `path` to `responder` and returns the session handle. The
    /// offer is sent before this returns; everything else happens on the
    /// session's own task.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unusable or the offer cannot be
    /// sent.
    pub async fn create_outgoing_transfer(
        &self,
        responder: &str,
        path: impl Into<PathBuf>,
    ) -> Result<SessionHandle> {
        OutgoingSession::spawn(
            Arc::clone(&self.channel),
            self.registry.clone(),
            responder.to_string(),
            path.into(),
            self.config.clone(),
        )
        .await
    }

    fn surface_request(&self, sig: SignalMessage) {
        let Some(offer) = sig.offer else {
            warn!(session_id = %sig.session_id, "Discarding offer without file metadata");
            return;
        };
        let request = SessionRequest {
            from: sig.from,
            initiator: sig.initiator,
            offer,
            session_id: SessionId::from_wire(sig.session_id),
            channel: Arc::clone(&self.channel),
            registry: self.registry.clone(),
            config: self.config.clone(),
            decided: Arc::new(Mutex::new(false)),
        };
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        if listeners.is_empty() {
            debug!(session_id = %request.session_id, "No session request listeners, offer dropped");
            return;
        }
        // Dead listeners are pruned as they are discovered.
        listeners.retain(|(id, tx)| {
            let alive = tx.send(request.clone()).is_ok();
            if !alive {
                debug!(listener = ?id, "Pruning dead session request listener");
            }
            alive
        });
    }
}

async fn dispatch<C: SignalChannel>(
    manager: Arc<SessionManager<C>>,
    mut inbound: mpsc::UnboundedReceiver<ChannelMessage>,
) {
    debug!("Signaling dispatch running");
    while let Some(msg) = inbound.recv().await {
        let session_id = msg.session_id().to_string();

        if let Some(route) = manager.registry.route(&session_id) {
            if route.send(msg).is_err() {
                // Session task ended without unregistering yet.
                manager.registry.remove(&SessionId::from_wire(session_id));
            }
            continue;
        }

        match msg {
            ChannelMessage::Signal(sig) if sig.action == SignalAction::Offer => {
                info!(session_id = %session_id, from = %sig.from, "Session requested");
                manager.surface_request(sig);
            }
            other => {
                debug!(
                    session_id = %session_id,
                    from = %other.sender(),
                    "Discarding signaling for unknown session"
                );
            }
        }
    }
    debug!("Signaling dispatch stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use airlift_core::channel::{MemoryChannel, MemoryChannelHub};
    use airlift_core::signal::sha256_hex;

    use super::*;
    use crate::session::SessionEvent;

    const A: &str = "alice@hub";
    const B: &str = "bob@hub";

    fn start_manager(
        hub: &MemoryChannelHub,
        address: &str,
        config: SessionConfig,
    ) -> Arc<SessionManager<MemoryChannel>> {
        let (channel, inbound) = hub.endpoint(address);
        SessionManager::start(Arc::new(channel), inbound, config)
    }

    async fn write_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    /// Waits for a matching session event, panicking on session end or timeout.
    async fn wait_for_event(
        handle: &mut SessionHandle,
        matches_fn: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        timeout(Duration::from_secs(10), async {
            loop {
                match handle.next_event().await {
                    Some(ev) if matches_fn(&ev) => return ev,
                    Some(_) => {}
                    None => panic!("session ended before expected event"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    async fn next_request(
        rx: &mut mpsc::UnboundedReceiver<SessionRequest<MemoryChannel>>,
    ) -> SessionRequest<MemoryChannel> {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for session request")
            .expect("request listener closed")
    }

    /// End-to-end: offer a 1024-byte file, responder accepts, receiver
    /// ends up with the bytes and a matching digest; the initiator only
    /// reaches the transfer after an accept.
    #[tokio::test]
    async fn when_offer_accepted_expect_full_transfer_with_matching_digest() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let recv_dir = tempfile::tempdir().unwrap();

        let content = vec![0xA5u8; 1024];
        let path = write_file(send_dir.path(), "report.txt", &content).await;

        let a = start_manager(&hub, A, SessionConfig::default());
        let b = start_manager(
            &hub,
            B,
            SessionConfig {
                verify_digest: true,
                ..SessionConfig::default()
            },
        );
        let (_lid, mut requests) = b.add_session_request_listener();

        let mut out = a.create_outgoing_transfer(B, &path).await.unwrap();

        // Exactly one request, carrying the offered metadata.
        let request = next_request(&mut requests).await;
        assert_eq!(request.from(), A);
        assert_eq!(request.offer().name, "report.txt");
        assert_eq!(request.offer().size, 1024);
        assert_eq!(request.offer().digest, sha256_hex(&content));

        let mut inc = request.accept(recv_dir.path()).await.unwrap().unwrap();

        // Initiator: accept strictly precedes the transfer phase.
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::Accepted)).await;
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::EndpointSent { .. })).await;
        let done = wait_for_event(&mut out, |e| {
            matches!(e, SessionEvent::TransferComplete { .. })
        })
        .await;
        assert!(matches!(
            done,
            SessionEvent::TransferComplete {
                bytes: 1024,
                digest_ok: None
            }
        ));
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::Terminated)).await;

        // Receiver: full byte count, digest verified against the offer.
        let done = wait_for_event(&mut inc, |e| {
            matches!(e, SessionEvent::TransferComplete { .. })
        })
        .await;
        assert!(matches!(
            done,
            SessionEvent::TransferComplete {
                bytes: 1024,
                digest_ok: Some(true)
            }
        ));
        wait_for_event(&mut inc, |e| matches!(e, SessionEvent::Terminated)).await;

        let received = tokio::fs::read(recv_dir.path().join("report.txt"))
            .await
            .unwrap();
        assert_eq!(received, content);
    }

    /// End-to-end: responder declines; the initiator observes the
    /// terminate and ends without ever advertising an endpoint.
    #[tokio::test]
    async fn when_offer_declined_expect_terminated_without_endpoint() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let path = write_file(send_dir.path(), "nope.bin", b"unwanted").await;

        let a = start_manager(&hub, A, SessionConfig::default());
        let b = start_manager(&hub, B, SessionConfig::default());
        let (_lid, mut requests) = b.add_session_request_listener();

        let mut out = a.create_outgoing_transfer(B, &path).await.unwrap();
        let request = next_request(&mut requests).await;
        request.decline().await.unwrap();

        // Collect every event until the session ends: no endpoint, no
        // transfer, just offered → declined → terminated.
        let mut saw_declined = false;
        while let Some(ev) = timeout(Duration::from_secs(10), out.next_event())
            .await
            .expect("timed out")
        {
            match ev {
                SessionEvent::Declined => saw_declined = true,
                SessionEvent::EndpointSent { .. }
                | SessionEvent::TransferProgress { .. }
                | SessionEvent::TransferComplete { .. } => {
                    panic!("declined session must not reach the transfer phase")
                }
                _ => {}
            }
        }
        assert!(saw_declined);
    }

    /// A request already decided is a no-op for later deciders.
    #[tokio::test]
    async fn when_request_decided_twice_expect_second_decision_noop() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let recv_dir = tempfile::tempdir().unwrap();
        let path = write_file(send_dir.path(), "once.bin", b"once").await;

        let a = start_manager(&hub, A, SessionConfig::default());
        let b = start_manager(&hub, B, SessionConfig::default());
        let (_l1, mut requests_1) = b.add_session_request_listener();
        let (_l2, mut requests_2) = b.add_session_request_listener();

        let _out = a.create_outgoing_transfer(B, &path).await.unwrap();

        // Both listeners see the same offer.
        let r1 = next_request(&mut requests_1).await;
        let r2 = next_request(&mut requests_2).await;
        assert_eq!(r1.session_id(), r2.session_id());

        let handle = r1.accept(recv_dir.path()).await.unwrap();
        assert!(handle.is_some());

        // Second decision loses: no session, no error.
        assert!(r2.accept(recv_dir.path()).await.unwrap().is_none());
        r2.decline().await.unwrap();
    }

    /// Terminating twice is a no-op the second time, at any state.
    #[tokio::test]
    async fn when_terminated_twice_expect_single_terminated_event() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let path = write_file(send_dir.path(), "idle.bin", b"idle").await;

        let a = start_manager(&hub, A, SessionConfig::default());
        // Nobody listens on B's side; the offer just sits there.
        let _b = start_manager(&hub, B, SessionConfig::default());

        let mut out = a.create_outgoing_transfer(B, &path).await.unwrap();
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::Offered)).await;

        out.terminate().await;
        out.terminate().await;

        let mut terminated = 0;
        while let Some(ev) = timeout(Duration::from_secs(10), out.next_event())
            .await
            .expect("timed out")
        {
            if matches!(ev, SessionEvent::Terminated) {
                terminated += 1;
            }
        }
        assert_eq!(terminated, 1);
    }

    /// Signaling bearing an unknown session id is discarded: it creates
    /// no request and does not disturb a live session.
    #[tokio::test]
    async fn when_unknown_session_id_arrives_expect_no_request_and_no_effect() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let path = write_file(send_dir.path(), "live.bin", b"live").await;

        let a = start_manager(&hub, A, SessionConfig::default());
        let b = start_manager(&hub, B, SessionConfig::default());
        let (_lid, mut requests) = b.add_session_request_listener();

        let mut out = a.create_outgoing_transfer(B, &path).await.unwrap();
        let live_request = next_request(&mut requests).await;

        // A third party sprays stray non-offer signaling at both sides.
        let (mallory, _rx) = hub.endpoint("mallory@hub");
        for target in [A, B] {
            mallory
                .send(ChannelMessage::Signal(SignalMessage::accept(
                    target,
                    "mallory@hub",
                    "no-such-session",
                )))
                .await
                .unwrap();
        }

        // No new request surfaced for the stray signaling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(requests.try_recv().is_err());

        // The live session is unaffected: it still negotiates normally.
        let recv_dir = tempfile::tempdir().unwrap();
        let mut inc = live_request.accept(recv_dir.path()).await.unwrap().unwrap();
        wait_for_event(&mut inc, |e| {
            matches!(e, SessionEvent::TransferComplete { .. })
        })
        .await;
        wait_for_event(&mut out, |e| {
            matches!(e, SessionEvent::TransferComplete { .. })
        })
        .await;
    }

    /// End-to-end: the responder abruptly drops its connecting socket
    /// mid-stream; the initiator takes the peer-closed path, not the
    /// failure path.
    #[tokio::test]
    async fn when_responder_drops_socket_mid_stream_expect_peer_closed() {
        use tokio::io::AsyncReadExt;

        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();

        // Large enough that the sender cannot finish inside the socket
        // buffers before the responder goes away.
        let content = vec![9u8; 8 * 1024 * 1024];
        let path = write_file(send_dir.path(), "big.bin", &content).await;

        let a = start_manager(&hub, A, SessionConfig::default());

        // Scripted responder on a raw channel endpoint: accept the offer,
        // connect to the advertised host, read a little, then vanish
        // without any terminate signaling.
        let (bob, mut bob_rx) = hub.endpoint(B);
        tokio::spawn(async move {
            let offer = loop {
                match bob_rx.recv().await.unwrap() {
                    ChannelMessage::Signal(sig) if sig.action == SignalAction::Offer => break sig,
                    _ => {}
                }
            };
            bob.send(ChannelMessage::Signal(SignalMessage::accept(
                &offer.initiator,
                &offer.responder,
                &offer.session_id,
            )))
            .await
            .unwrap();

            let advert = loop {
                match bob_rx.recv().await.unwrap() {
                    ChannelMessage::StreamHost(advert) => break advert,
                    _ => {}
                }
            };
            let mut stream = tokio::net::TcpStream::connect(advert.endpoint.socket_addr())
                .await
                .unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            drop(stream);
        });

        let mut out = a.create_outgoing_transfer(B, &path).await.unwrap();
        let ev = wait_for_event(&mut out, |e| {
            matches!(
                e,
                SessionEvent::PeerClosed | SessionEvent::Failed { .. } | SessionEvent::Terminated
            )
        })
        .await;
        assert!(
            matches!(ev, SessionEvent::PeerClosed),
            "expected the peer-closed path, got {ev:?}"
        );
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::Terminated)).await;
    }

    /// A removed listener no longer receives session requests.
    #[tokio::test]
    async fn when_listener_removed_expect_no_request_delivered() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let path = write_file(send_dir.path(), "quiet.bin", b"quiet").await;

        let a = start_manager(&hub, A, SessionConfig::default());
        let b = start_manager(&hub, B, SessionConfig::default());

        let (lid, mut requests) = b.add_session_request_listener();
        b.remove_session_request_listener(lid);

        let _out = a.create_outgoing_transfer(B, &path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(requests.try_recv().is_err());
    }

    /// With a negotiation timeout configured, an unanswered offer fails
    /// instead of waiting forever.
    #[tokio::test]
    async fn when_offer_unanswered_past_timeout_expect_failed() {
        let hub = MemoryChannelHub::new();
        let send_dir = tempfile::tempdir().unwrap();
        let path = write_file(send_dir.path(), "slow.bin", b"slow").await;

        let a = start_manager(
            &hub,
            A,
            SessionConfig {
                negotiation_timeout: Some(Duration::from_millis(200)),
                ..SessionConfig::default()
            },
        );
        // B exists but has no listeners, so the offer is never answered.
        let _b = start_manager(&hub, B, SessionConfig::default());

        let mut out = a.create_outgoing_transfer(B, &path).await.unwrap();
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::Failed { .. })).await;
        wait_for_event(&mut out, |e| matches!(e, SessionEvent::Terminated)).await;
    }

    /// Offering a missing file fails up front, before any signaling state
    /// is created.
    #[tokio::test]
    async fn when_offering_missing_file_expect_error() {
        let hub = MemoryChannelHub::new();
        let a = start_manager(&hub, A, SessionConfig::default());
        let _b = start_manager(&hub, B, SessionConfig::default());

        let result = a
            .create_outgoing_transfer(B, "/nonexistent/airlift.bin")
            .await;
        assert!(result.is_err());
    }
}
