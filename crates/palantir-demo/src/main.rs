use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use palantir_core::{Identity, NetworkDescriptor, Palantir, PeerEvent, PeerId};

const ENV_IDENTITY: &str = "PALANTIR_IDENTITY";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage:");
        eprintln!("  palantir-demo chat <relay_addr> [--relay-id <hex>] [--plain]");
        eprintln!("  palantir-demo keygen");
        std::process::exit(2);
    }
    match args[1].as_str() {
        "chat" => {
            let relay = args.get(2).context("missing relay_addr")?;
            run_chat(relay, &args[3..]).await
        }
        "keygen" => {
            keygen();
            Ok(())
        }
        _ => {
            anyhow::bail!("unknown mode");
        }
    }
}

/// Print a fresh identity in the form accepted by `PALANTIR_IDENTITY` and the relay config.
fn keygen() {
    let identity = Identity::generate();
    let (sign, kex) = identity.to_bytes();
    println!("PEER_ID_HEX={}", identity.peer_id());
    println!("IDENTITY_SECRET_HEX={}{}", hex::encode(sign), hex::encode(kex));
}

async fn run_chat(relay: &str, options: &[String]) -> anyhow::Result<()> {
    let mut descriptor =
        NetworkDescriptor::from_env().context("reading descriptor from environment")?;
    descriptor.relay_address = relay.to_string();
    let mut options = options.iter();
    while let Some(option) = options.next() {
        match option.as_str() {
            "--relay-id" => {
                let hex = options.next().context("--relay-id requires a value")?;
                descriptor.relay_id = Some(hex.clone());
            }
            "--plain" => descriptor.layers.clear(),
            other => anyhow::bail!("unknown option {other}"),
        }
    }

    let identity = match std::env::var(ENV_IDENTITY) {
        Ok(secret) => Identity::from_secret_hex(&secret).context("parsing PALANTIR_IDENTITY")?,
        Err(_) => Identity::generate(),
    };

    let palantir = Palantir::connect(&descriptor, identity)
        .await
        .with_context(|| format!("connecting to {relay}"))?;
    println!("connected as {}", palantir.local_id());
    println!("type '<peer_hex_prefix> <text>' to send, '/peers' to list, '/quit' to leave");

    let mut events = palantir.subscribe_peer_events()?;
    tokio::spawn(async move {
        while let Ok(event) = events.next().await {
            match event {
                PeerEvent::Joined(peer) => println!("* {} joined", peer.short()),
                PeerEvent::Left(peer) => println!("* {} left", peer.short()),
            }
        }
    });

    let mut inbox = palantir.receive()?;
    tokio::spawn(async move {
        while let Ok(delivery) = inbox.next().await {
            println!(
                "<{}> {}",
                delivery.peer.short(),
                String::from_utf8_lossy(&delivery.payload)
            );
        }
        println!("* disconnected");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/peers" => {
                for handle in palantir.peers() {
                    println!("  {}", handle.peer_id);
                }
                continue;
            }
            _ => {}
        }

        let Some((prefix, text)) = line.split_once(' ') else {
            eprintln!("expected '<peer_hex_prefix> <text>'");
            continue;
        };
        let peer = match resolve(&palantir, prefix) {
            Ok(peer) => peer,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        if let Err(e) = palantir.send(peer, Bytes::copy_from_slice(text.as_bytes())).await {
            eprintln!("send failed: {e}");
        }
    }

    info!("leaving");
    palantir.disconnect().await;
    Ok(())
}

/// Find the single known peer whose hex id starts with `prefix`.
fn resolve(palantir: &Palantir, prefix: &str) -> anyhow::Result<PeerId> {
    let prefix = prefix.to_ascii_lowercase();
    let mut matches = palantir
        .peers()
        .into_iter()
        .map(|h| h.peer_id)
        .filter(|id| id.to_hex().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(peer), None) => Ok(peer),
        (None, _) => anyhow::bail!("no peer matches '{prefix}'"),
        (Some(_), Some(_)) => anyhow::bail!("'{prefix}' matches more than one peer"),
    }
}
