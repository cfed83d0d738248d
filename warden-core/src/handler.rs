//! The DHCP state machine. One [`Handler`] serves every worker; per-pool
//! locking lives in the lease manager, the only shared mutable state here
//! is the gateway cache.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pnet::util::MacAddr;
use tracing::{debug, error, info, trace, warn};

use config::{Config, Network, Scope};
use lease_manager::{LeaseManager, OFFER_HOLD_SECS};
use proto::packet::BOOT_REQUEST;
use proto::{code, MessageType, Options, Packet};
use store::models::{unix_now, RELEASED_AT};
use store::{Device, Store};

/// Committed lease ends are padded by this much to absorb client clock
/// drift.
const CLOCK_SKEW_SECS: i64 = 10;

pub struct Handler {
    cfg: Arc<Config>,
    leases: Arc<LeaseManager>,
    store: Arc<dyn Store>,
    /// relay address → network name, so repeat packets from a known
    /// relay skip the linear network scan
    gateway_cache: Mutex<HashMap<Ipv4Addr, String>>,
    block_blacklist: bool,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("block_blacklist", &self.block_blacklist)
            .finish_non_exhaustive()
    }
}

impl Handler {
    pub fn new(
        cfg: Arc<Config>,
        leases: Arc<LeaseManager>,
        store: Arc<dyn Store>,
        block_blacklist: bool,
    ) -> Self {
        Handler {
            cfg,
            leases,
            store,
            gateway_cache: Mutex::new(HashMap::new()),
            block_blacklist,
        }
    }

    /// Process one datagram. Returns the reply and where to send it, or
    /// nothing when the packet is malformed, not for us, or policy says
    /// to stay silent.
    pub async fn serve(&self, buf: &[u8], peer: SocketAddr) -> Option<(Packet, SocketAddr)> {
        let pkt = match Packet::decode(buf) {
            Ok(pkt) => pkt,
            Err(err) => {
                trace!(%err, %peer, "discarding malformed packet");
                return None;
            }
        };
        if pkt.op != BOOT_REQUEST {
            return None;
        }
        let opts = pkt.options();
        let Some(msg_type) = opts.msg_type() else {
            trace!(%peer, "discarding packet without a usable message type");
            return None;
        };
        let mac = packet_mac(&pkt);
        debug!(?msg_type, %mac, ip = %pkt.ciaddr, relay_ip = %pkt.giaddr, "incoming request");

        let device = match self.store.get_device(mac).await {
            Ok(device) => device,
            Err(err) => {
                error!(%err, %mac, "failed getting device");
                return None;
            }
        };
        if device.blacklisted && self.block_blacklist {
            debug!(%mac, "dropping blacklisted client");
            return None;
        }

        let resp = match msg_type {
            MessageType::Discover => self.discover(&pkt, &opts, &device).await,
            MessageType::Request => self.request(&pkt, &opts, &device).await,
            MessageType::Release => self.release(&pkt, &opts, &device).await,
            MessageType::Decline => self.decline(&pkt, &opts, &device).await,
            MessageType::Inform => self.inform(&pkt, &opts, &device).await,
            // server-originated types on the request path
            _ => None,
        };
        resp.map(|resp| (resp, reply_dest(&pkt, peer)))
    }

    fn registered_for(&self, network: &Network, device: &Device) -> bool {
        device.registered && !device.blacklisted && !network.ignore_registration()
    }

    fn network_for_gateway(&self, giaddr: Ipv4Addr) -> Option<&Network> {
        let mut cache = self.gateway_cache.lock();
        if let Some(name) = cache.get(&giaddr) {
            return self.cfg.network(name);
        }
        let network = self.cfg.find_network(giaddr)?;
        cache.insert(giaddr, network.name().to_owned());
        Some(network)
    }

    fn cached_gateway_network(&self, giaddr: Ipv4Addr) -> Option<&Network> {
        let name = self.gateway_cache.lock().get(&giaddr).cloned()?;
        self.cfg.network(&name)
    }

    /// Pool options for the reply, with the client's host block (if any)
    /// overlaid on top.
    fn reply_options(
        &self,
        scope: Scope<'_>,
        registered: bool,
        mac: MacAddr,
        req_opts: &Options,
    ) -> Vec<(u8, Vec<u8>)> {
        let params = req_opts.get(code::PARAMETER_REQUEST_LIST);
        match self.cfg.host(mac).filter(|h| !h.options().is_empty()) {
            Some(host) => {
                let mut merged = host.options().clone();
                merged.merge_missing(scope.options(registered));
                merged.select_order_or_all(params)
            }
            None => scope.options(registered).select_order_or_all(params),
        }
    }

    fn nak(&self, pkt: &Packet) -> Option<Packet> {
        Some(Packet::reply(
            pkt,
            MessageType::Nak,
            self.cfg.global().server_identifier(),
            Ipv4Addr::UNSPECIFIED,
            Duration::ZERO,
            &[],
        ))
    }

    async fn discover(&self, pkt: &Packet, opts: &Options, device: &Device) -> Option<Packet> {
        let mac = packet_mac(pkt);
        let Some(network) = self.network_for_gateway(pkt.giaddr) else {
            warn!(relay_ip = %pkt.giaddr, "network not found for relay");
            return None;
        };
        let registered = self.registered_for(network, device);

        // fixed-address host reservations first, then the client's
        // current lease, then the free/desperate searches
        let reserved = self
            .cfg
            .host(mac)
            .and_then(|h| h.fixed_address())
            .and_then(|ip| {
                self.leases
                    .claim_reservation(network.name(), ip, mac, registered)
            });
        let found = reserved
            .or_else(|| self.leases.lease_by_mac(network.name(), mac, registered))
            .or_else(|| self.leases.free_lease(network.name(), registered))
            .or_else(|| self.leases.free_lease_desperate(network.name(), registered));
        let Some((lease, pool_id)) = found else {
            error!(
                network = network.name(),
                registered,
                %mac,
                "no free leases available in network"
            );
            return None;
        };

        let now = unix_now();
        let lease = self
            .leases
            .update_lease(network.name(), pool_id, lease.ip, |l| {
                l.offered = true;
                l.start = now;
                l.end = now + OFFER_HOLD_SECS;
                l.mac = mac;
            })?;
        // not persisted: the slot is only committed to storage when the
        // client comes back with a REQUEST

        let scope = network.scope(self.cfg.global(), pool_id)?;
        let requested = opts.requested_lease_time().unwrap_or(Duration::ZERO);
        let lease_time = scope.lease_time(requested, registered);
        let reply_opts = self.reply_options(scope, registered, mac, opts);

        info!(
            ip = %lease.ip,
            %mac,
            registered,
            network = network.name(),
            relay_ip = %pkt.giaddr,
            "offering lease to client"
        );
        Some(Packet::reply(
            pkt,
            MessageType::Offer,
            self.cfg.global().server_identifier(),
            lease.ip,
            lease_time,
            &reply_opts,
        ))
    }

    async fn request(&self, pkt: &Packet, opts: &Options, device: &Device) -> Option<Packet> {
        if let Some(server_id) = opts.get_ip(code::SERVER_IDENTIFIER) {
            if server_id != self.cfg.global().server_identifier() {
                // message for another dhcp server
                return None;
            }
        }

        let mac = packet_mac(pkt);
        let requested_ip = opts.requested_ip().unwrap_or(pkt.ciaddr);
        if requested_ip.is_unspecified() {
            return self.nak(pkt);
        }

        let network = if pkt.giaddr.is_unspecified() {
            match self.cfg.find_network(requested_ip) {
                Some(network) => network,
                None => {
                    info!(ip = %requested_ip, "REQUEST for IP not in any scope");
                    return self.nak(pkt);
                }
            }
        } else {
            // an unknown relay has to go through DISCOVER first
            match self.cached_gateway_network(pkt.giaddr) {
                Some(network) => network,
                None => return self.nak(pkt),
            }
        };
        let registered = self.registered_for(network, device);

        let Some((lease, pool_id)) =
            self.leases
                .lease_by_ip(network.name(), requested_ip, registered)
        else {
            info!(
                ip = %requested_ip,
                %mac,
                network = network.name(),
                registered,
                "client requested a lease that does not exist"
            );
            return self.nak(pkt);
        };
        // a fresh slot that was never offered has a zero MAC
        if lease.mac == MacAddr::zero() {
            info!(
                ip = %requested_ip,
                %mac,
                network = network.name(),
                "client requested a lease that was never offered"
            );
            return self.nak(pkt);
        }
        if lease.mac != mac {
            info!(
                ip = %requested_ip,
                %mac,
                lease_mac = %lease.mac,
                network = network.name(),
                "client requested a lease not belonging to them"
            );
            return self.nak(pkt);
        }

        let scope = network.scope(self.cfg.global(), pool_id)?;
        let requested_time = opts.requested_lease_time().unwrap_or(Duration::ZERO);
        let lease_time = scope.lease_time(requested_time, registered);
        let now = unix_now();
        let hostname = opts
            .get(code::HOST_NAME)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        let lease = self
            .leases
            .update_lease(network.name(), pool_id, requested_ip, |l| {
                l.start = now;
                l.end = now + lease_time.as_secs() as i64 + CLOCK_SKEW_SECS;
                l.offered = false;
                l.hostname = hostname;
            })?;

        if let Err(err) = self.store.put_lease(&lease).await {
            error!(%err, %mac, "error saving lease");
            return self.nak(pkt);
        }

        if device.registered {
            let mut device = device.clone();
            device.last_seen = now;
            if let Err(err) = self.store.put_device(&device).await {
                // not critical, the client still gets its lease
                error!(%err, %mac, "failed updating device last-seen");
            }
        }

        let reply_opts = self.reply_options(scope, registered, mac, opts);
        info!(
            ip = %lease.ip,
            %mac,
            duration = ?lease_time,
            network = network.name(),
            relay_ip = %pkt.giaddr,
            registered,
            hostname = %lease.hostname,
            "acknowledging request"
        );
        Some(Packet::reply(
            pkt,
            MessageType::Ack,
            self.cfg.global().server_identifier(),
            lease.ip,
            lease_time,
            &reply_opts,
        ))
    }

    async fn release(&self, pkt: &Packet, _opts: &Options, device: &Device) -> Option<Packet> {
        let ip = pkt.ciaddr;
        if ip.is_unspecified() {
            return None;
        }
        let mac = packet_mac(pkt);
        let Some(network) = self.cfg.find_network(ip) else {
            warn!(%ip, "RELEASE for IP not in any scope");
            return None;
        };
        let registered = self.registered_for(network, device);
        let pool_id = match self.leases.lease_by_ip(network.name(), ip, registered) {
            Some((lease, pool_id)) if lease.mac == mac => pool_id,
            Some((lease, _)) => {
                warn!(
                    %ip,
                    %mac,
                    lease_mac = %lease.mac,
                    network = network.name(),
                    "client tried to release a lease not belonging to them"
                );
                return None;
            }
            None => {
                warn!(%ip, %mac, network = network.name(), "RELEASE for unknown lease");
                return None;
            }
        };

        let lease = self.leases.update_lease(network.name(), pool_id, ip, |l| {
            l.start = RELEASED_AT;
            l.end = RELEASED_AT;
        })?;
        info!(%ip, %mac, network = network.name(), "releasing lease");
        if let Err(err) = self.store.put_lease(&lease).await {
            error!(%err, %mac, "error saving lease");
        }
        None
    }

    async fn decline(&self, pkt: &Packet, opts: &Options, device: &Device) -> Option<Packet> {
        // a well-formed DECLINE carries the disputed address in option
        // 50; older clients put it in ciaddr
        let ip = opts.requested_ip().unwrap_or(pkt.ciaddr);
        if ip.is_unspecified() {
            return None;
        }
        let mac = packet_mac(pkt);
        let Some(network) = self.cfg.find_network(ip) else {
            warn!(%ip, "DECLINE for IP not in any scope");
            return None;
        };
        let registered = self.registered_for(network, device);
        let pool_id = match self.leases.lease_by_ip(network.name(), ip, registered) {
            Some((lease, pool_id)) if lease.mac == mac => pool_id,
            Some((lease, _)) => {
                warn!(
                    declined_ip = %ip,
                    %mac,
                    lease_mac = %lease.mac,
                    network = network.name(),
                    "client tried to decline a lease not belonging to them"
                );
                return None;
            }
            None => {
                warn!(%ip, %mac, network = network.name(), "DECLINE for unknown lease");
                return None;
            }
        };

        let lease = self.leases.update_lease(network.name(), pool_id, ip, |l| {
            l.abandoned = true;
            l.start = RELEASED_AT;
            l.end = RELEASED_AT;
        })?;
        warn!(%ip, %mac, network = network.name(), "lease declined, address abandoned");
        if let Err(err) = self.store.put_lease(&lease).await {
            error!(%err, %mac, "error saving lease");
        }
        None
    }

    async fn inform(&self, pkt: &Packet, opts: &Options, device: &Device) -> Option<Packet> {
        let ip = pkt.ciaddr;
        if ip.is_unspecified() {
            return None;
        }
        let network = self.cfg.find_network(ip)?;
        let pool_id = network.pool_of_ip(ip)?;
        let registered = self.registered_for(network, device);
        let scope = network.scope(self.cfg.global(), pool_id)?;
        let reply_opts = self.reply_options(scope, registered, packet_mac(pkt), opts);

        info!(%ip, mac = %packet_mac(pkt), network = network.name(), "informing client");
        Some(Packet::reply(
            pkt,
            MessageType::Ack,
            self.cfg.global().server_identifier(),
            Ipv4Addr::UNSPECIFIED,
            Duration::ZERO,
            &reply_opts,
        ))
    }
}

/// Where a reply goes: back to the relay when one forwarded the packet,
/// broadcast when the client has no address yet or asked for it,
/// otherwise unicast to the client.
pub(crate) fn reply_dest(req: &Packet, peer: SocketAddr) -> SocketAddr {
    if !req.giaddr.is_unspecified() {
        SocketAddr::new(peer.ip(), proto::SERVER_PORT)
    } else if req.ciaddr.is_unspecified() || req.broadcast() {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), proto::CLIENT_PORT)
    } else {
        SocketAddr::new(req.ciaddr.into(), proto::CLIENT_PORT)
    }
}

fn packet_mac(pkt: &Packet) -> MacAddr {
    let hw = pkt.hardware_addr();
    let mut octets = [0u8; 6];
    let n = hw.len().min(6);
    octets[..n].copy_from_slice(&hw[..n]);
    MacAddr::new(
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5],
    )
}
