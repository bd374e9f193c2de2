mod command;
mod event;
mod ui;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use peerproxy_core::contact::LocalIdentity;
use peerproxy_engine::direct::DirectChannel;
use peerproxy_engine::engine::{Engine, EngineCmd, EngineConfig};
use peerproxy_engine::tcp::{TcpConnector, TcpListenerFactory};
use peerproxy_engine::vpn::ExternalVpnDevice;

use crate::command::{Command, Context, execute, parse_command};
use crate::event::spawn_event_printer;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

/// peerproxy: share your internet connection with friends.
///
/// Starts an engine that links directly with other instances, negotiates
/// consent with each contact and runs proxy sessions: as a getter you get
/// a local SOCKS5 endpoint routed through a friend, as a sharer your
/// connection carries a friend's traffic.
#[derive(Parser, Debug)]
#[command(name = "peerproxy", version, about)]
struct Args {
    /// Address to listen on for links from other instances.
    #[arg(short, long, default_value = "0.0.0.0:4343")]
    listen: String,

    /// Network name; only instances on the same network can link.
    #[arg(long, default_value = "direct")]
    network: String,

    /// Your user id on the network.
    #[arg(short, long)]
    user: String,

    /// Display name shown to your contacts.
    #[arg(short, long)]
    name: Option<String>,

    /// Instance id of this client (random by default).
    #[arg(long)]
    instance: Option<String>,

    /// Where getter sessions bind their SOCKS5 endpoint.
    #[arg(long, default_value = "127.0.0.1:0")]
    socks_bind: String,

    /// Seconds to wait for a peer to answer a session request.
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    /// Helper program driving the platform VPN
    /// (`<cmd> start <port>` / `<cmd> stop`).
    #[arg(long)]
    vpn_command: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.  Default to "warn" for library crates so
    // only the CLI's own output is visible.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerproxy_cli=info,warn")),
        )
        .init();

    let defaults = EngineConfig::default();
    let config = EngineConfig {
        instance_id: args.instance.clone().unwrap_or(defaults.instance_id),
        socks_bind: args.socks_bind.clone(),
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
    };
    let identity = LocalIdentity {
        network: args.network.clone(),
        user_id: args.user.clone(),
        instance_id: config.instance_id.clone(),
        display_name: args.name.clone().unwrap_or_else(|| args.user.clone()),
    };

    let engine = Engine::new();
    let channel = DirectChannel::new(identity.clone(), engine.network_sender());
    let listen_addr = match channel.listen(&TcpListenerFactory, &args.listen).await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Failed to listen on {}: {e:#}", args.listen);
            std::process::exit(1);
        }
    };

    let core = engine.start(
        channel.clone(),
        TcpListenerFactory,
        TcpConnector,
        ExternalVpnDevice::new(args.vpn_command.clone()),
        config,
    );
    spawn_event_printer(core.subscribe());
    info!(listen = %listen_addr, user = %identity.user_id, instance = %identity.instance_id, "peerproxy started");

    // ── Banner ──────────────────────────────────────────────────
    print_banner(&listen_addr, &identity);
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let ctx = Context {
        core: core.clone(),
        channel,
        identity,
    };
    let mut stdin = BufReader::new(tokio::io::stdin());

    while let Some(line) = read_line(&mut stdin).await {
        if line.is_empty() {
            print_prompt();
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(cmd) => execute(cmd, &ctx).await,
            Err(message) => println!("  ❓ {message}  Type 'help' for usage."),
        }

        print_prompt();
    }

    println!("\n  Shutting down...");
    let _ = core.send(EngineCmd::ShutDown).await;
    // Give sessions a moment to notify their peers.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("  Bye! 👋");
}
