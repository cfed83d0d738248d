#![allow(clippy::cognitive_complexity)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::runtime::Builder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod cli;

use cli::Parser;
use config::Config;
use external_api::ExternalApi;
use lease_manager::LeaseManager;
use store::{KvStore, MemoryStore, Store};
use warden_core::{Handler, Management, Server};

fn main() {
    // parses from cli or environment var
    let config = cli::Config::parse();
    if let Err(err) = init_tracing(&config.warden_log) {
        eprintln!("failed to initialise logging: {err}");
        std::process::exit(1);
    }
    debug!(?config);

    let rt = match Builder::new_multi_thread()
        .thread_name(cli::DEFAULT_THREAD_NAME)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = rt.block_on(start(config)) {
        error!(?err, "exited with error");
        std::process::exit(1);
    }
}

/// Log as "json" or "standard" (unstructured), controlled by LOG_FORMAT.
fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).or_else(|_| EnvFilter::try_new("info"))?;
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!(path = %config.config_path.display(), "parsing network configuration");
    let dhcp_cfg = Arc::new(
        Config::parse_file(&config.config_path).context("error loading network configuration")?,
    );
    if config.check_config {
        info!("configuration looks good");
        return Ok(());
    }

    let store: Arc<dyn Store> = match &config.database_path {
        Some(path) => {
            info!(path = %path.display(), "opening lease database");
            Arc::new(
                KvStore::open(path)
                    .await
                    .context("error opening lease database")?,
            )
        }
        None => {
            warn!("no database path set, leases will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let leases = Arc::new(LeaseManager::new(Arc::clone(&dhcp_cfg)));
    let loaded = leases
        .load_persisted(store.as_ref())
        .await
        .context("error loading persisted leases")?;
    info!(loaded, "loaded persisted leases");

    let handler = Arc::new(Handler::new(
        Arc::clone(&dhcp_cfg),
        Arc::clone(&leases),
        Arc::clone(&store),
        config.block_blacklist,
    ));
    let mgmt = Arc::new(Management::new(
        Arc::clone(&dhcp_cfg),
        Arc::clone(&leases),
        Arc::clone(&store),
    ));

    let token = CancellationToken::new();
    let api = ExternalApi::new(config.api_addr, mgmt).start(token.clone());

    let server = Server::new(handler, store, config.listen_addr, config.workers);
    let mut server_task = tokio::spawn(server.run(token.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("caught shutdown signal, draining workers");
            token.cancel();
        }
        res = &mut server_task => {
            // the server only returns on its own for startup failures
            token.cancel();
            let _ = api.await;
            return res.map_err(|err| anyhow!(err))?;
        }
    }

    match server_task.await {
        Ok(res) => res?,
        Err(err) => return Err(anyhow!(err)),
    }
    if let Err(err) = api.await {
        error!(%err, "error waiting for management api");
    }
    Ok(())
}
