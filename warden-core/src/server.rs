//! UDP listener and the worker-task pool that drives the handler.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::handler::Handler;
use store::Store;

/// Ethernet-sized receive buffer; DHCP packets never legitimately exceed
/// one MTU.
const MAX_DATAGRAM: usize = 1500;

/// Runs a pool of worker tasks, each reading a datagram from the shared
/// socket, driving it through the handler end-to-end, and writing any
/// reply. Workers are independent; there is no per-client session.
pub struct Server {
    handler: Arc<Handler>,
    store: Arc<dyn Store>,
    addr: SocketAddr,
    workers: usize,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// `workers == 0` means one per hardware thread.
    pub fn new(
        handler: Arc<Handler>,
        store: Arc<dyn Store>,
        addr: SocketAddr,
        workers: usize,
    ) -> Self {
        Server {
            handler,
            store,
            addr,
            workers,
        }
    }

    /// Serve until `shutdown` fires. Workers finish their current packet,
    /// then the store is closed exactly once.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let workers = if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        };
        let soc = Arc::new(create_socket(self.addr).context("failed to bind dhcp socket")?);
        info!(addr = %self.addr, workers, "dhcp server listening");

        let mut tasks = Vec::with_capacity(workers);
        for id in 0..workers {
            tasks.push(tokio::spawn(worker(
                id,
                Arc::clone(&soc),
                Arc::clone(&self.handler),
                shutdown.clone(),
            )));
        }
        for task in tasks {
            if let Err(err) = task.await {
                error!(%err, "worker task failed");
            }
        }

        self.store.close().await.context("closing store")?;
        info!("dhcp server stopped");
        Ok(())
    }
}

fn create_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;
    socket
        .set_reuse_address(true)
        .context("failed to set_reuse_address")?;
    socket
        .set_broadcast(true)
        .context("failed to set_broadcast")?;
    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking mode on socket")?;
    socket.bind(&addr.into()).context("failed to bind address")?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn worker(
    id: usize,
    soc: Arc<UdpSocket>,
    handler: Arc<Handler>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                trace!(id, "worker received shutdown");
                return;
            }
            res = soc.recv_from(&mut buf) => match res {
                Ok(recv) => recv,
                Err(err) => {
                    error!(%err, id, "udp receive failed");
                    continue;
                }
            }
        };

        // a panic anywhere in dispatch must not take the worker down
        match AssertUnwindSafe(handler.serve(&buf[..len], peer))
            .catch_unwind()
            .await
        {
            Ok(Some((resp, dst))) => {
                if let Err(err) = soc.send_to(&resp.encode(), dst).await {
                    error!(%err, %dst, "failed sending reply");
                }
            }
            Ok(None) => {}
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                error!(id, %peer, panic = %msg, "recovered from panic in dhcp handler");
            }
        }
    }
}
