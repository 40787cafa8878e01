use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use airlift_core::endpoint::StreamEndpoint;

/// How a sender-side transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte of the file was written to the socket.
    Complete { bytes: u64 },
    /// The peer closed the connection before the file was fully written.
    PeerClosed { bytes: u64 },
}

/// How a receiver-side transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Exactly the declared byte count arrived and was persisted.
    Complete {
        bytes: u64,
        /// Hex SHA-256 of the received bytes.
        digest: String,
        /// Final path of the stored file.
        path: PathBuf,
    },
    /// The connection dropped before the declared size was reached.
    /// The partial file has been removed.
    Incomplete { bytes: u64 },
}

/// True for the error kinds a peer produces by closing its end of the
/// connection while we are mid-stream.
pub(crate) fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Reduces a filename from the wire to its final path component so a
/// malicious offer cannot escape the receive directory.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let candidate = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        "received.bin".to_string()
    } else {
        candidate.to_string()
    }
}

/// Sender side of the data channel: waits for exactly one inbound
/// connection on `listener`, then streams `path` to it in `chunk_size`
/// pieces.
///
/// A peer that closes early yields [`SendOutcome::PeerClosed`], not an
/// error; any other I/O failure is an error.
///
/// # Errors
///
/// Returns an error if accepting the connection, reading the file, or a
/// non-peer-closed socket write fails.
pub async fn send_file(
    listener: TcpListener,
    path: &Path,
    chunk_size: usize,
    mut on_progress: impl FnMut(u64),
) -> Result<SendOutcome> {
    let (mut stream, peer) = listener
        .accept()
        .await
        .context("failed to accept data connection")?;
    debug!(peer = %peer, file = %path.display(), "Data connection accepted");

    let mut file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        match stream.write_all(&buf[..n]).await {
            Ok(()) => {
                sent += n as u64;
                on_progress(sent);
            }
            Err(e) if is_peer_closed(&e) => {
                info!(peer = %peer, bytes = sent, "Peer closed data connection early");
                return Ok(SendOutcome::PeerClosed { bytes: sent });
            }
            Err(e) => {
                return Err(e).context("failed to write to data connection");
            }
        }
    }

    if let Err(e) = stream.shutdown().await {
        // The bytes are already out; a failed FIN is not worth failing
        // the transfer over.
        warn!(peer = %peer, error = %e, "Failed to shut down data connection");
    }
    info!(peer = %peer, bytes = sent, "File sent");
    Ok(SendOutcome::Complete { bytes: sent })
}

/// Receiver side of the data channel: connects to `endpoint` and reads
/// exactly `size` bytes into `dest_dir/<sanitized filename>`.
///
/// The bytes land in a `.part` file that is renamed into place only when
/// the full count arrived; a short stream removes the partial file and
/// yields [`ReceiveOutcome::Incomplete`].
///
/// # Errors
///
/// Returns an error if connecting, writing to disk, or a non-peer-closed
/// socket read fails.
pub async fn receive_file(
    endpoint: &StreamEndpoint,
    size: u64,
    dest_dir: &Path,
    filename: &str,
    chunk_size: usize,
    mut on_progress: impl FnMut(u64),
) -> Result<ReceiveOutcome> {
    let addr = endpoint.socket_addr();
    let mut stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to stream host {addr}"))?;
    debug!(addr = %addr, size = size, "Connected to stream host");

    let final_path = dest_dir.join(sanitize_filename(filename));
    let part_path = final_path.with_extension({
        let mut ext = final_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        if !ext.is_empty() {
            ext.push('.');
        }
        ext.push_str("part");
        ext
    });

    let mut out = File::create(&part_path)
        .await
        .with_context(|| format!("failed to create {}", part_path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];
    let mut received: u64 = 0;

    while received < size {
        let want = usize::try_from((size - received).min(chunk_size as u64))
            .expect("capped by chunk_size which fits in usize");
        let read = match stream.read(&mut buf[..want]).await {
            Ok(n) => n,
            Err(e) if is_peer_closed(&e) => 0,
            Err(e) => {
                drop(out);
                remove_partial(&part_path).await;
                return Err(e).context("failed to read from data connection");
            }
        };
        if read == 0 {
            warn!(
                addr = %addr,
                received = received,
                expected = size,
                "Stream ended before declared size"
            );
            drop(out);
            remove_partial(&part_path).await;
            return Ok(ReceiveOutcome::Incomplete { bytes: received });
        }
        out.write_all(&buf[..read])
            .await
            .with_context(|| format!("failed to write {}", part_path.display()))?;
        hasher.update(&buf[..read]);
        received += read as u64;
        on_progress(received);
    }

    out.flush()
        .await
        .with_context(|| format!("failed to flush {}", part_path.display()))?;
    drop(out);
    tokio::fs::rename(&part_path, &final_path)
        .await
        .with_context(|| format!("failed to move {} into place", part_path.display()))?;

    info!(path = %final_path.display(), bytes = received, "File received");
    Ok(ReceiveOutcome::Complete {
        bytes: received,
        digest: hex::encode(hasher.finalize()),
        path: final_path,
    })
}

/// Best-effort removal of a partial download; failure is only logged.
async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove partial file");
    }
}
