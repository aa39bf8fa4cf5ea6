//! Tandem CLI
//!
//! Usage:
//!   tandem demo [--file PATH] [--chat TEXT] [--out DIR] [--reject]
//!   tandem roles <id>...
//!   tandem config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem::{
    assign_roles, ConnectionState, DirectoryPersistence, MemoryPersistence, MemorySignaling,
    MockNetwork, Session, SessionConfig, SessionEvent, SessionEvents, SessionHandle,
    SessionOptions, TransferStatus,
};
use tandem_config::{get_config_path, Config};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Two-peer sessions with chat and consent-gated file transfer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two peers in-process and exchange a chat line and a file
    Demo {
        /// File to offer from the first peer to the second
        #[arg(long)]
        file: Option<PathBuf>,
        /// Chat line to send once connected
        #[arg(long, default_value = "hello from peer-a")]
        chat: String,
        /// Download directory of the receiving peer (defaults to config)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Receiver rejects the offered file
        #[arg(long)]
        reject: bool,
        /// Session key both peers join
        #[arg(long, default_value = "demo")]
        session: String,
    },
    /// Show the role each peer id would receive
    Roles {
        /// Peer ids present in the session
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show the config path and effective config
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("tandem=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            file,
            chat,
            out,
            reject,
            session,
        } => {
            let config = Config::load_or_default();
            let out = out.unwrap_or_else(|| config.download_dir());
            run_demo(&session, config.session_config(), file, &chat, out, reject).await?;
        }
        Commands::Roles { ids } => {
            for (peer, role) in assign_roles(&ids) {
                println!("{}\t{}", peer, role);
            }
        }
        Commands::Config => {
            let config = Config::load()?;
            println!("# {}", get_config_path().display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render config")?
            );
        }
    }

    Ok(())
}

async fn run_demo(
    session_key: &str,
    config: SessionConfig,
    file: Option<PathBuf>,
    chat: &str,
    out: PathBuf,
    reject: bool,
) -> Result<()> {
    let signaling = MemorySignaling::new();
    let network = MockNetwork::new();

    let (alice, mut alice_events) = Session::connect(
        SessionOptions::new(session_key, "peer-a").with_config(config.clone()),
        signaling.clone(),
        Arc::new(network.factory()),
        Arc::new(MemoryPersistence::new()),
    )
    .await
    .context("peer-a failed to join")?;
    let (bob, mut bob_events) = Session::connect(
        SessionOptions::new(session_key, "peer-b").with_config(config),
        signaling,
        Arc::new(network.factory()),
        Arc::new(DirectoryPersistence::new(&out)),
    )
    .await
    .context("peer-b failed to join")?;

    for (handle, events) in [(&alice, &mut alice_events), (&bob, &mut bob_events)] {
        if let SessionEvent::RoleAssigned(role) =
            next_event(events, |e| matches!(e, SessionEvent::RoleAssigned(_))).await?
        {
            println!("{} is {}", handle.local_peer_id(), role);
        }
    }

    wait_connected(&alice).await?;
    wait_connected(&bob).await?;
    println!("Connected over session '{}'", session_key);

    alice.send_chat(chat).await?;
    if let SessionEvent::Chat(msg) =
        next_event(&mut bob_events, |e| matches!(e, SessionEvent::Chat(_))).await?
    {
        println!("peer-b received chat: {}", msg.text);
    }

    if let Some(path) = file {
        let offered = alice
            .offer_path(&path, None)
            .await
            .with_context(|| format!("Failed to offer {}", path.display()))?;
        println!(
            "peer-a offered {} ({} bytes, {} chunks)",
            offered.name, offered.size, offered.total_chunks
        );

        next_event(&mut bob_events, |e| matches!(e, SessionEvent::IncomingFile(_))).await?;
        if reject {
            bob.reject_file(&offered.id).await?;
            next_event(&mut alice_events, |e| {
                matches!(e, SessionEvent::TransferUpdated(info)
                    if info.id == offered.id && info.status.is_terminal())
            })
            .await?;
            let status = alice.transfer_status(&offered.id).await?;
            println!(
                "peer-b rejected {}; sender status: {}",
                offered.name,
                status.map(|s| s.to_string()).unwrap_or_default()
            );
        } else {
            bob.approve_file(&offered.id).await?;
            let received = next_event(&mut bob_events, |e| match e {
                SessionEvent::FileReceived { .. } => true,
                SessionEvent::TransferUpdated(info) => {
                    matches!(info.status, TransferStatus::Error(_))
                }
                _ => false,
            })
            .await?;
            match received {
                SessionEvent::FileReceived { info, path } => {
                    println!("peer-b saved {} to {}", info.name, path.display())
                }
                SessionEvent::TransferUpdated(info) => {
                    bail!("transfer of {} failed: {}", info.name, info.status)
                }
                _ => {}
            }
        }
    }

    let stats = bob.stats().await?;
    println!(
        "peer-b routed {} frames, dropped {}",
        stats.router.routed_total(),
        stats.router.dropped()
    );

    let report = alice.disconnect().await;
    println!(
        "peer-a disconnected ({} unfinished transfers discarded)",
        report.discarded_transfers
    );
    let _ = tokio::time::timeout(
        STEP_TIMEOUT,
        bob.wait_for_state(ConnectionState::Disconnected),
    )
    .await;
    bob.disconnect().await;
    Ok(())
}

async fn wait_connected(handle: &SessionHandle) -> Result<()> {
    tokio::time::timeout(
        STEP_TIMEOUT,
        handle.wait_for_state(ConnectionState::Connected),
    )
    .await
    .with_context(|| format!("{} timed out connecting", handle.local_peer_id()))??;
    Ok(())
}

async fn next_event<F>(events: &mut SessionEvents, mut pred: F) -> Result<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .context("timed out waiting for session event")?
            .context("session ended")?;
        if let SessionEvent::Error(e) = &event {
            eprintln!("session error: {}", e);
        }
        if pred(&event) {
            return Ok(event);
        }
    }
}
