use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Signaling actions understood by this build.
///
/// The wire names follow the Jingle convention so a future real XMPP
/// channel can map them one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    #[serde(rename = "session-initiate")]
    Offer,
    #[serde(rename = "session-accept")]
    Accept,
    #[serde(rename = "session-terminate")]
    Terminate,
}

/// File metadata carried by an [`SignalAction::Offer`].
///
/// The digest is informational: the receiver may use it to verify the
/// transferred bytes after completion, but a mismatch does not invalidate
/// the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub name: String,
    pub size: u64,
    pub digest: String,
}

impl FileOffer {
    /// Builds a file offer, rejecting empty file names.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is empty.
    pub fn new(name: impl Into<String>, size: u64, digest: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), "offer file name must not be empty");
        Ok(Self {
            name,
            size,
            digest: digest.into(),
        })
    }
}

/// A signaling message scoped to one negotiation session.
///
/// Immutable once built. `offer` is present for [`SignalAction::Offer`]
/// only and absent for accept/terminate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: String,
    pub to: String,
    pub initiator: String,
    pub responder: String,
    pub session_id: String,
    pub action: SignalAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<FileOffer>,
}

impl SignalMessage {
    /// Builds a session-initiate message carrying the file metadata.
    #[must_use]
    pub fn offer(initiator: &str, responder: &str, session_id: &str, offer: FileOffer) -> Self {
        Self {
            from: initiator.to_string(),
            to: responder.to_string(),
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            session_id: session_id.to_string(),
            action: SignalAction::Offer,
            offer: Some(offer),
        }
    }

    /// Builds a session-accept message (responder → initiator).
    #[must_use]
    pub fn accept(initiator: &str, responder: &str, session_id: &str) -> Self {
        Self {
            from: responder.to_string(),
            to: initiator.to_string(),
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            session_id: session_id.to_string(),
            action: SignalAction::Accept,
            offer: None,
        }
    }

    /// Builds a session-terminate message from `from` to `to`.
    #[must_use]
    pub fn terminate(
        from: &str,
        to: &str,
        initiator: &str,
        responder: &str,
        session_id: &str,
    ) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            session_id: session_id.to_string(),
            action: SignalAction::Terminate,
            offer: None,
        }
    }
}

/// Generates a fresh session id.
///
/// Session ids are opaque correlation tokens; they only need to be unique
/// within the lifetime of the two endpoints involved.
#[must_use]
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Computes the hex-encoded SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Computes the hex-encoded SHA-256 digest of a file, reading it in
/// fixed-size chunks.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn file_sha256_hex(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("failed to read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
