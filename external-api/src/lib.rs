//! # external-api
//!
//! HTTP surface for operating the server: health, device registration
//! lifecycle, lease queries, and pool statistics. Routes:
//!
//! ```text
//! GET    /health
//! GET    /ping
//! GET    /networks
//! GET    /networks/:name/leases
//! GET    /leases/:ip
//! GET    /stats/pools
//! GET    /devices/:mac
//! POST   /devices/:mac/register
//! POST   /devices/:mac/unregister
//! POST   /devices/:mac/blacklist
//! DELETE /devices/:mac/blacklist
//! DELETE /devices/:mac
//! ```
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing, Extension, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use warden_core::Management;

pub use crate::models::{DeviceBody, LeaseBody, PoolStatBody};

/// The management HTTP API. `start` spawns the server task; it runs until
/// the cancellation token fires.
pub struct ExternalApi {
    addr: SocketAddr,
    mgmt: Arc<Management>,
}

impl std::fmt::Debug for ExternalApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalApi")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl ExternalApi {
    pub fn new(addr: SocketAddr, mgmt: Arc<Management>) -> Self {
        ExternalApi { addr, mgmt }
    }

    pub fn router(mgmt: Arc<Management>) -> Router {
        Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/networks", routing::get(handlers::networks))
            .route("/networks/:name/leases", routing::get(handlers::network_leases))
            .route("/leases/:ip", routing::get(handlers::lease))
            .route("/stats/pools", routing::get(handlers::pool_stats))
            .route(
                "/devices/:mac",
                routing::get(handlers::device).delete(handlers::delete_device),
            )
            .route("/devices/:mac/register", routing::post(handlers::register))
            .route(
                "/devices/:mac/unregister",
                routing::post(handlers::unregister),
            )
            .route(
                "/devices/:mac/blacklist",
                routing::post(handlers::blacklist).delete(handlers::remove_blacklist),
            )
            .layer(Extension(mgmt))
    }

    async fn run(self) -> Result<()> {
        let tcp = TcpListener::bind(&self.addr)
            .await
            .context("failed to bind management api")?;
        info!(addr = %self.addr, "management api listening");
        axum::serve(tcp, Self::router(self.mgmt)).await?;
        Ok(())
    }

    /// Spawn the API server; it stops when `shutdown` fires.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => debug!("management api stopping"),
                res = self.run() => {
                    if let Err(err) = res {
                        error!(%err, "management api exited");
                    }
                }
            }
        })
    }
}

mod handlers {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::{Extension, Json};
    use pnet::util::MacAddr;
    use tracing::error;

    use store::StoreError;
    use warden_core::Management;

    use crate::models::{DeviceBody, LeaseBody, PoolStatBody};

    type Mgmt = Extension<Arc<Management>>;

    pub(crate) async fn ok() -> StatusCode {
        StatusCode::OK
    }

    pub(crate) async fn ping() -> StatusCode {
        StatusCode::OK
    }

    fn parse_mac(mac: &str) -> Result<MacAddr, StatusCode> {
        mac.to_lowercase()
            .parse()
            .map_err(|_| StatusCode::BAD_REQUEST)
    }

    fn internal(err: StoreError) -> StatusCode {
        error!(%err, "store error serving management request");
        StatusCode::INTERNAL_SERVER_ERROR
    }

    pub(crate) async fn networks(Extension(mgmt): Mgmt) -> Json<Vec<String>> {
        Json(mgmt.network_names())
    }

    pub(crate) async fn network_leases(
        Extension(mgmt): Mgmt,
        Path(name): Path<String>,
    ) -> Json<Vec<LeaseBody>> {
        Json(
            mgmt.leases_in_network(&name)
                .into_iter()
                .map(LeaseBody::from)
                .collect(),
        )
    }

    pub(crate) async fn lease(
        Extension(mgmt): Mgmt,
        Path(ip): Path<String>,
    ) -> Result<impl IntoResponse, StatusCode> {
        let ip: Ipv4Addr = ip.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
        match mgmt.lease(ip).await.map_err(internal)? {
            Some(lease) => Ok(Json(LeaseBody::from(lease))),
            None => Err(StatusCode::NOT_FOUND),
        }
    }

    pub(crate) async fn pool_stats(Extension(mgmt): Mgmt) -> Json<Vec<PoolStatBody>> {
        Json(
            mgmt.pool_stats()
                .into_iter()
                .map(PoolStatBody::from)
                .collect(),
        )
    }

    pub(crate) async fn device(
        Extension(mgmt): Mgmt,
        Path(mac): Path<String>,
    ) -> Result<Json<DeviceBody>, StatusCode> {
        let mac = parse_mac(&mac)?;
        let device = mgmt.device(mac).await.map_err(internal)?;
        Ok(Json(DeviceBody::from(device)))
    }

    pub(crate) async fn register(
        Extension(mgmt): Mgmt,
        Path(mac): Path<String>,
    ) -> Result<StatusCode, StatusCode> {
        mgmt.register(parse_mac(&mac)?).await.map_err(internal)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn unregister(
        Extension(mgmt): Mgmt,
        Path(mac): Path<String>,
    ) -> Result<StatusCode, StatusCode> {
        mgmt.unregister(parse_mac(&mac)?).await.map_err(internal)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn blacklist(
        Extension(mgmt): Mgmt,
        Path(mac): Path<String>,
    ) -> Result<StatusCode, StatusCode> {
        mgmt.blacklist(parse_mac(&mac)?).await.map_err(internal)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn remove_blacklist(
        Extension(mgmt): Mgmt,
        Path(mac): Path<String>,
    ) -> Result<StatusCode, StatusCode> {
        mgmt.remove_blacklist(parse_mac(&mac)?)
            .await
            .map_err(internal)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn delete_device(
        Extension(mgmt): Mgmt,
        Path(mac): Path<String>,
    ) -> Result<StatusCode, StatusCode> {
        mgmt.delete(parse_mac(&mac)?).await.map_err(internal)?;
        Ok(StatusCode::NO_CONTENT)
    }
}

/// JSON bodies for API responses.
pub mod models {
    use lease_manager::PoolStat;
    use serde::{Deserialize, Serialize};
    use store::{Device, Lease};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct LeaseBody {
        pub ip: String,
        pub mac: String,
        pub network: String,
        pub start: i64,
        pub end: i64,
        pub hostname: String,
        pub abandoned: bool,
        pub offered: bool,
        pub registered: bool,
    }

    impl From<Lease> for LeaseBody {
        fn from(l: Lease) -> Self {
            LeaseBody {
                ip: l.ip.to_string(),
                mac: l.mac.to_string(),
                network: l.network,
                start: l.start,
                end: l.end,
                hostname: l.hostname,
                abandoned: l.abandoned,
                offered: l.offered,
                registered: l.registered,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DeviceBody {
        pub mac: String,
        pub registered: bool,
        pub blacklisted: bool,
        pub last_seen: i64,
    }

    impl From<Device> for DeviceBody {
        fn from(d: Device) -> Self {
            DeviceBody {
                mac: d.mac.to_string(),
                registered: d.registered,
                blacklisted: d.blacklisted,
                last_seen: d.last_seen,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PoolStatBody {
        pub network: String,
        pub subnet: String,
        pub range_start: String,
        pub range_end: String,
        pub registered: bool,
        pub total: u32,
        pub active: u32,
        pub claimed: u32,
        pub abandoned: u32,
        pub free: u32,
    }

    impl From<PoolStat> for PoolStatBody {
        fn from(s: PoolStat) -> Self {
            PoolStatBody {
                network: s.network,
                subnet: s.subnet.to_string(),
                range_start: s.range_start.to_string(),
                range_end: s.range_end.to_string(),
                registered: s.registered,
                total: s.total,
                active: s.active,
                claimed: s.claimed,
                abandoned: s.abandoned,
                free: s.free,
            }
        }
    }
}
