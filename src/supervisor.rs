//! Supervisor (C8): wires the node-id, filter, store and KRPC engine
//! together, owns the UDP socket, and drives the graceful shutdown
//! sequence on SIGINT/SIGTERM.
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, info, instrument};

use crate::config::Config;
use crate::dht::Engine;
use crate::error::CrawlerError;
use crate::filter::{self, SeenSet};
use crate::node_id;
use crate::store::TorrentStore;

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs the crawler to completion: binds, bootstraps, serves until a
    /// shutdown signal arrives, then shuts down. Returns `Err` only for
    /// the startup failures spec.md §7 classifies as "Resource" errors.
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<(), CrawlerError> {
        let own_id = node_id::generate();
        info!(%own_id, "starting dht crawler");

        let seen = SeenSet::load_or_new(&self.config.filter_path, self.config.filter_capacity, self.config.filter_error_rate)
            .map_err(|e| CrawlerError::FilterCorrupt {
                path: self.config.filter_path.clone(),
                reason: e.to_string(),
            })?;

        let store = Arc::new(TorrentStore::new(&self.config.storage_dir).map_err(|e| CrawlerError::StorageDirUnavailable {
            path: self.config.storage_dir.clone(),
            source: e,
        })?);

        let bind_addr = std::net::SocketAddr::V4(std::net::SocketAddrV4::new(self.config.listen_host, self.config.listen_port));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| CrawlerError::UdpBind { addr: bind_addr, source: e })?;
        info!(%bind_addr, "udp socket bound");

        let engine = Engine::new(own_id, Arc::new(socket), seen, store, self.config.fetch_concurrency);
        let handles = engine.start(self.config.bootstrap.clone(), self.config.find_interval, self.config.status_interval);

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");

        handles.close().await;
        filter::snapshot_non_fatal(&engine_seen_set(&engine), &self.config.filter_path);
        info!(fetched = engine.fetched_count(), "shutdown complete");
        Ok(())
    }
}

/// Accesses the engine's seen-set for the final snapshot. The engine
/// doesn't expose the set directly since nothing else should touch it
/// mid-run; this narrow accessor exists only for the shutdown path.
fn engine_seen_set(engine: &Arc<Engine>) -> std::sync::MutexGuard<'_, SeenSet> {
    engine.seen_set_for_snapshot()
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl_c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install sigterm handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
