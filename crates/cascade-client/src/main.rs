//! `mls_client`: interactive peer for the Cascade delivery service.
//!
//! ```text
//! mls_client <identity> <pki-host> <network-rtt-ms>
//! ```
//!
//! - `identity`: unique string identifier for this client
//! - `pki-host`: host of the PKI directory service
//! - `network-rtt-ms`: round trip to the farthest peer, in milliseconds;
//!   every protocol timeout derives from it
//!
//! Commands on stdin: `create`, `add <id[,id,…]>`, `remove <id>`,
//! `update`, `message <text>`, `stop`.
//!
//! The process is a single-threaded reactor: one tokio current-thread
//! runtime multiplexing stdin, the listening socket, per-peer
//! connections, and the timer wheel.

mod client;
mod net;
mod pki;

use std::time::Duration;

use anyhow::Context;
use cascade_core::Credential;
use cascade_proto::wire::WireEncode;
use cascade_proto::Identity;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::{sleep_until, Instant};

use crate::client::MlsClient;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: {} <identity> <pki-host> <network-rtt-ms>", args[0]);
        std::process::exit(1);
    }
    let identity = args[1].clone();
    let pki_host = args[2].clone();
    let rtt_ms: u64 = args[3].parse().context("network-rtt-ms must be an integer")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let local = LocalSet::new();
    runtime.block_on(local.run_until(run(identity, pki_host, Duration::from_millis(rtt_ms))))
}

async fn run(identity: String, pki_host: String, rtt: Duration) -> anyhow::Result<()> {
    let listener = TcpListener::bind("0.0.0.0:0").await.context("binding listener")?;
    let port = listener.local_addr().context("reading listener address")?.port();

    let mut rng = StdRng::from_entropy();
    let credential = Credential::generate(Identity::from(identity.as_str()), &mut rng);

    pki::publish(
        &pki_host,
        &identity,
        port,
        credential.key_package().encode_to_bytes(),
    )
    .await
    .context("publishing to the pki")?;
    tracing::info!(identity, port, "published to pki");

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    net::spawn_listener(listener, frames_tx);

    let mut client = MlsClient::new(credential, pki_host, rtt);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Client is running, you can now use the commands: create, add, remove, update and message");

    loop {
        // With no timer pending, park the sleep far in the future.
        let deadline = client
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        if !client.handle_command(line.trim()).await {
                            break;
                        }
                    },
                    None => break, // stdin closed
                }
            },
            frame = frames_rx.recv() => {
                match frame {
                    Some(frame) => client.handle_frame(frame).await,
                    None => break,
                }
            },
            _ = sleep_until(deadline) => {
                client.handle_due_timers().await;
            },
        }
    }

    Ok(())
}
