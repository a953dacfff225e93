//! palantir-relay: relay server binary

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use palantir_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::load().context("loading relay configuration")?;
    let server = Arc::new(RelayServer::new(config).context("creating relay server")?);
    info!(
        relay = %server.peer_id(),
        addr = %server.config().listen_addr,
        "starting palantir-relay"
    );

    let mut running = tokio::spawn(server.clone().run());
    let finished = tokio::select! {
        finished = &mut running => finished,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("shutdown requested");
            server.shutdown();
            running.await
        }
    };

    match finished.context("relay task panicked")? {
        Ok(()) => {
            if let Ok(text) = server.metrics().export() {
                info!("final metrics:\n{text}");
            }
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}
