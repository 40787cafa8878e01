use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use airlift_core::channel::MemoryChannelHub;
use airlift_engine::manager::SessionManager;
use airlift_engine::session::{SessionConfig, SessionEvent};

/// Airlift — peer-to-peer file transfer, loopback demo.
///
/// Runs a sender and a receiver in one process, wired over the in-memory
/// signaling hub, and pushes the given file through the full negotiation
/// and transfer stack: offer, accept (or decline), stream-host exchange,
/// and the raw TCP byte stream.
#[derive(Parser, Debug)]
#[command(name = "airlift", version, about)]
struct Args {
    /// File to transfer.
    file: PathBuf,

    /// Directory where the received copy is stored.
    #[arg(short, long, default_value = "/tmp/airlift")]
    receive_dir: PathBuf,

    /// Decline the offer on the receiving side instead of accepting.
    #[arg(long)]
    decline: bool,

    /// Verify the received bytes against the offered digest.
    #[arg(long)]
    verify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the demo output.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    std::fs::create_dir_all(&args.receive_dir).with_context(|| {
        format!(
            "failed to create receive directory {}",
            args.receive_dir.display()
        )
    })?;

    let hub = MemoryChannelHub::new();
    let (send_channel, send_inbound) = hub.endpoint("sender@loopback");
    let (recv_channel, recv_inbound) = hub.endpoint("receiver@loopback");

    let sender = SessionManager::start(
        Arc::new(send_channel),
        send_inbound,
        SessionConfig::default(),
    );
    let receiver = SessionManager::start(
        Arc::new(recv_channel),
        recv_inbound,
        SessionConfig {
            verify_digest: args.verify,
            ..SessionConfig::default()
        },
    );

    // Receiving side: take the first session request and decide.
    let (_listener, mut requests) = receiver.add_session_request_listener();
    let receive_dir = args.receive_dir.clone();
    let decline = args.decline;
    let receiver_task = tokio::spawn(async move {
        let Some(request) = requests.recv().await else {
            return Ok(());
        };
        info!(
            from = %request.from(),
            name = %request.offer().name,
            size = request.offer().size,
            "Offer received"
        );
        if decline {
            request.decline().await
        } else {
            if let Some(mut session) = request.accept(receive_dir).await? {
                while session.next_event().await.is_some() {}
            }
            Ok(())
        }
    });

    let mut session = sender
        .create_outgoing_transfer("receiver@loopback", &args.file)
        .await?;
    println!(
        "Offering {} to receiver@loopback (session {})",
        args.file.display(),
        session.id
    );

    let mut failed = None;
    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::Accepted => println!("Offer accepted"),
            SessionEvent::Declined => {
                println!("Offer declined");
                failed = Some("transfer not accepted".to_string());
            }
            SessionEvent::EndpointSent { endpoint } => {
                println!("Stream host advertised on {endpoint}");
            }
            SessionEvent::TransferComplete { bytes, .. } => {
                println!("Sent {bytes} bytes");
            }
            SessionEvent::PeerClosed => println!("Peer closed the connection early"),
            SessionEvent::Failed { message } => {
                println!("Transfer failed: {message}");
                failed = Some(message);
            }
            SessionEvent::Terminated => println!("Session terminated"),
            _ => {}
        }
    }

    receiver_task
        .await
        .context("receiver task panicked")?
        .context("receiving side failed")?;

    if let Some(message) = failed {
        bail!(message);
    }
    if !args.decline {
        println!(
            "Received copy stored under {}",
            args.receive_dir.display()
        );
    }
    Ok(())
}
