#![allow(unused_doc_comments)]
/**
 * main.rs
 *
 * Command line front end: listen for or dial a peer through a relay
 */

use anyhow::{anyhow, Context, Result};
use p2p_rendezvous::nat_traversal::{IpResolver, StaticIpResolver, StunResolver, UdpPinger};
use p2p_rendezvous::relay::{Relay, WebSocketRelay};
use p2p_rendezvous::{Channel, Dialer, Ed25519Verifier, Identity, Keystore, Listener, P2pConfig};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match args[1].as_str() {
        "listen" => {
            if args.len() < 3 {
                eprintln!("Usage: {} listen <service>", args[0]);
                std::process::exit(1);
            }
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_listener(&args[2]))?
        }
        "dial" => {
            if args.len() < 4 {
                eprintln!("Usage: {} dial <provider-identity> <service> [message]", args[0]);
                std::process::exit(1);
            }
            let message = args.get(4).map(String::as_str).unwrap_or("hello");
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_dialer(&args[2], &args[3], message))?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("p2p-rendezvous - authenticated NAT-traversing peer channels");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} listen <service>                            # Provider", program_name);
    eprintln!("  {} dial <provider-identity> <service> [message] # Consumer", program_name);
    eprintln!();
    eprintln!("  Environment variables:");
    eprintln!("    RELAY_URL          Pub/sub relay (required)");
    eprintln!("                       Example: wss://relay.example.com:8443");
    eprintln!();
    eprintln!("    STUN_SERVER        STUN server for public IP discovery");
    eprintln!("                       Example: stun.example.com:3478");
    eprintln!();
    eprintln!("    PUBLIC_IP          Fixed public IP, skips STUN");
    eprintln!();
    eprintln!("    P2P_SECRET_KEY     Hex Ed25519 secret key (optional: random identity)");
    eprintln!();
    eprintln!("    P2P_CONFIG         JSON config file, replaces the P2P_* tuning variables");
    eprintln!();
    eprintln!("    P2P_*              Tuning, e.g. P2P_PORTS_PER_ATTEMPT=5");
    eprintln!("    RUST_LOG           Log filter, e.g. debug");
}

/// Collaborators shared by both modes
struct Setup {
    config: P2pConfig,
    relay: Arc<dyn Relay>,
    keystore: Arc<Keystore>,
    identity: Identity,
    ip_resolver: Arc<dyn IpResolver>,
    pinger: Arc<UdpPinger>,
}

async fn setup() -> Result<Setup> {
    let config = match env::var("P2P_CONFIG") {
        Ok(path) => P2pConfig::load(&path)?,
        Err(_) => P2pConfig::from_env()?,
    };

    let relay_url = env::var("RELAY_URL")
        .context("RELAY_URL environment variable not set. Example: wss://relay.example.com:8443")?;
    let relay = WebSocketRelay::connect(&relay_url, config.accept_invalid_certs).await?;

    let ip_resolver: Arc<dyn IpResolver> = match (env::var("PUBLIC_IP"), env::var("STUN_SERVER")) {
        (Ok(ip), _) => Arc::new(StaticIpResolver::new(ip)),
        (_, Ok(server)) => Arc::new(StunResolver::new(server).with_timeout(config.stun_timeout())),
        _ => return Err(anyhow!("Set STUN_SERVER or PUBLIC_IP")),
    };

    let keystore = Arc::new(Keystore::new());
    let identity = match env::var("P2P_SECRET_KEY") {
        Ok(raw) => {
            let mut secret = [0u8; 32];
            hex::decode_to_slice(raw.trim(), &mut secret).context("P2P_SECRET_KEY must be 64 hex characters")?;
            keystore.import(&secret)
        }
        Err(_) => {
            let identity = keystore.generate();
            warn!("P2P_SECRET_KEY not set, using a random identity");
            identity
        }
    };

    info!(identity = %identity, relay = %relay_url, "ready");
    Ok(Setup {
        pinger: Arc::new(UdpPinger::new(&config)),
        config,
        relay: Arc::new(relay),
        keystore,
        identity,
        ip_resolver,
    })
}

async fn run_listener(service: &str) -> Result<()> {
    let setup = setup().await?;
    let listener = Listener::new(
        setup.relay,
        setup.keystore,
        Arc::new(Ed25519Verifier),
        setup.ip_resolver,
        setup.pinger,
    )
    .with_config(setup.config);

    let handle = listener.listen(&setup.identity, service, install_handlers).await?;
    println!("Listening as {} for '{}' on {}", setup.identity, service, handle.topic());
    println!("Dial with: p2p-rendezvous dial {} {} <message>", setup.identity, service);

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    handle.stop().await?;
    Ok(())
}

fn install_handlers(channel: Channel) {
    info!(peers = ?channel.peer_addrs(), "peer connected");
    channel.handle("ping", |ctx| async move { ctx.ok_with_reply("pong") });
    channel.handle("echo", |ctx| async move {
        let data = ctx.data().to_vec();
        ctx.ok_with_reply(data)
    });
}

async fn run_dialer(provider: &str, service: &str, message: &str) -> Result<()> {
    let setup = setup().await?;
    let dialer = Dialer::new(
        setup.relay,
        setup.keystore,
        Arc::new(Ed25519Verifier),
        setup.ip_resolver,
        setup.pinger,
    )
    .with_config(setup.config);

    let provider = Identity::from_address(provider);
    let channel = dialer.dial(&setup.identity, &provider, service, DIAL_TIMEOUT).await?;
    println!("Connected over {} socket(s)", channel.socket_count());

    let reply = channel.send("ping", "", REQUEST_TIMEOUT).await?;
    println!("ping -> {}", String::from_utf8_lossy(&reply.data));

    let reply = channel.send("echo", message, REQUEST_TIMEOUT).await?;
    println!("echo -> {}", String::from_utf8_lossy(&reply.data));

    channel.close().await;
    Ok(())
}
