//! # lease-manager
//!
//! Runtime lease state and allocation. The configuration's scope tree is
//! immutable; this crate mirrors it with one lease map per pool and
//! implements the allocation strategies the handler drives:
//!
//! 1. find the client's existing lease by MAC,
//! 2. find a free lease (recycle an expired/lapsed-offer slot, then
//!    extend into unused address space),
//! 3. desperate fallback (oldest expired slot, then reclaim an abandoned
//!    one) so a full pool still makes a best effort.
//!
//! Each pool map is guarded by its own mutex: allocation holds it for the
//! whole search, point lookups hold it only across the map read. Pools
//! never contend with each other.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pnet::util::MacAddr;
use tracing::{debug, trace};

use config::{Config, Network, PoolId, Subnet};
use store::models::unix_now;
use store::{Lease, Store, StoreError};

mod stats;
pub use stats::PoolStat;

/// Seconds an un-accepted OFFER keeps its slot reserved.
pub const OFFER_HOLD_SECS: i64 = 30;

/// Per-pool runtime state: the lease map plus the low-water index used to
/// extend into address space that has never been leased.
#[derive(Debug, Default)]
struct PoolLeases {
    leases: HashMap<Ipv4Addr, Lease>,
    next_unused: u32,
}

#[derive(Debug)]
struct NetworkLeases {
    /// lock order: only ever one pool lock held at a time
    pools: Vec<Vec<Mutex<PoolLeases>>>,
}

/// Lease state for every pool of every network.
#[derive(Debug)]
pub struct LeaseManager {
    cfg: Arc<Config>,
    networks: HashMap<String, NetworkLeases>,
}

impl LeaseManager {
    pub fn new(cfg: Arc<Config>) -> Self {
        let networks = cfg
            .networks()
            .map(|n| {
                let pools = n
                    .subnets()
                    .iter()
                    .map(|s| s.pools().iter().map(|_| Mutex::default()).collect())
                    .collect();
                (n.name().to_owned(), NetworkLeases { pools })
            })
            .collect();
        LeaseManager { cfg, networks }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    fn network(&self, name: &str) -> Option<(&Network, &NetworkLeases)> {
        Some((self.cfg.network(name)?, self.networks.get(name)?))
    }

    /// Iterate the pools of the track serving `registered` clients, in
    /// declaration order.
    fn eligible_pools<'a>(
        network: &'a Network,
        state: &'a NetworkLeases,
        registered: bool,
    ) -> impl Iterator<Item = (&'a Subnet, PoolId, &'a Mutex<PoolLeases>)> {
        network
            .subnets()
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.allow_unknown() != registered)
            .flat_map(move |(si, subnet)| {
                state.pools[si].iter().enumerate().map(move |(pi, lock)| {
                    (
                        subnet,
                        PoolId {
                            subnet: si,
                            pool: pi,
                        },
                        lock,
                    )
                })
            })
    }

    /// Linear scan for the lease currently bound to `mac` on the client's
    /// track.
    pub fn lease_by_mac(
        &self,
        network: &str,
        mac: MacAddr,
        registered: bool,
    ) -> Option<(Lease, PoolId)> {
        let (net, state) = self.network(network)?;
        for (_, id, lock) in Self::eligible_pools(net, state, registered) {
            let pool = lock.lock();
            if let Some(lease) = pool.leases.values().find(|l| l.mac == mac) {
                return Some((lease.clone(), id));
            }
        }
        None
    }

    /// Point lookup by IP on the client's track.
    pub fn lease_by_ip(
        &self,
        network: &str,
        ip: Ipv4Addr,
        registered: bool,
    ) -> Option<(Lease, PoolId)> {
        let (net, state) = self.network(network)?;
        for (_, id, lock) in Self::eligible_pools(net, state, registered) {
            let pool = lock.lock();
            if let Some(lease) = pool.leases.get(&ip) {
                return Some((lease.clone(), id));
            }
        }
        None
    }

    /// Find a free lease: first recycle a used slot (lapsed offer, or
    /// expired past the track's grace window), then synthesise a slot for
    /// the next never-used address. Pools are tried in declaration order.
    pub fn free_lease(&self, network: &str, registered: bool) -> Option<(Lease, PoolId)> {
        let (net, state) = self.network(network)?;
        let now = unix_now();
        let reg_grace = self.cfg.global().free_lease_after(true).as_secs() as i64;
        let unreg_grace = self.cfg.global().free_lease_after(false).as_secs() as i64;

        for (subnet, id, lock) in Self::eligible_pools(net, state, registered) {
            let pool_cfg = &subnet.pools()[id.pool];
            let mut pool = lock.lock();

            // pass A: recycle an existing slot
            let mut found: Option<Ipv4Addr> = None;
            for lease in pool.leases.values_mut() {
                if lease.abandoned {
                    // address in use by a device we don't know about
                    continue;
                }
                if lease.is_active(now) {
                    continue;
                }
                if lease.offered && now > lease.end {
                    // offer lapsed without a REQUEST
                    lease.offered = false;
                    found = Some(lease.ip);
                    break;
                }
                let grace = if lease.registered {
                    reg_grace
                } else {
                    unreg_grace
                };
                if now > lease.end + grace {
                    found = Some(lease.ip);
                    break;
                }
            }
            if let Some(ip) = found {
                return Some((pool.leases[&ip].clone(), id));
            }

            // pass B: extend into address space never handed out
            while let Some(ip) = pool_cfg.ip_at(pool.next_unused) {
                pool.next_unused += 1;
                if pool.leases.contains_key(&ip) {
                    continue;
                }
                let mut lease = Lease::new(ip);
                lease.network = net.name().to_owned();
                lease.registered = !subnet.allow_unknown();
                pool.leases.insert(ip, lease.clone());
                trace!(%ip, network, "created lease slot");
                return Some((lease, id));
            }
        }
        None
    }

    /// Last-ditch allocation for a full pool: the longest-expired
    /// non-active slot, then the first abandoned slot with its flag
    /// cleared. Some eligible candidate is returned, not a specific one.
    pub fn free_lease_desperate(
        &self,
        network: &str,
        registered: bool,
    ) -> Option<(Lease, PoolId)> {
        let (net, state) = self.network(network)?;
        let now = unix_now();

        for (_, id, lock) in Self::eligible_pools(net, state, registered) {
            let mut pool = lock.lock();

            let oldest = pool
                .leases
                .values()
                .filter(|l| !l.is_active(now))
                .min_by_key(|l| l.end)
                .map(|l| l.ip);
            if let Some(ip) = oldest {
                debug!(%ip, network, "desperate allocation reusing expired lease");
                return Some((pool.leases[&ip].clone(), id));
            }

            let abandoned = pool.leases.values().find(|l| l.abandoned).map(|l| l.ip);
            if let Some(ip) = abandoned {
                let lease = pool.leases.get_mut(&ip).expect("ip chosen from map");
                lease.abandoned = false;
                debug!(%ip, network, "desperate allocation reclaiming abandoned lease");
                return Some((lease.clone(), id));
            }
        }
        None
    }

    /// Claim a host reservation: the fixed address must sit in a pool of
    /// the client's track and must not be actively held by another MAC.
    pub fn claim_reservation(
        &self,
        network: &str,
        ip: Ipv4Addr,
        mac: MacAddr,
        registered: bool,
    ) -> Option<(Lease, PoolId)> {
        let (net, state) = self.network(network)?;
        let now = unix_now();
        for (subnet, id, lock) in Self::eligible_pools(net, state, registered) {
            if !subnet.pools()[id.pool].contains(ip) {
                continue;
            }
            let mut pool = lock.lock();
            match pool.leases.get(&ip) {
                Some(l) if l.mac != mac && l.mac != MacAddr::zero() && l.is_active(now) => {
                    debug!(%ip, network, "reserved address actively held by another client");
                    return None;
                }
                Some(l) => return Some((l.clone(), id)),
                None => {
                    let mut lease = Lease::new(ip);
                    lease.network = net.name().to_owned();
                    lease.registered = !subnet.allow_unknown();
                    pool.leases.insert(ip, lease.clone());
                    return Some((lease, id));
                }
            }
        }
        None
    }

    /// Apply a mutation to one lease under its pool lock and return the
    /// updated copy.
    pub fn update_lease<F>(
        &self,
        network: &str,
        id: PoolId,
        ip: Ipv4Addr,
        mutate: F,
    ) -> Option<Lease>
    where
        F: FnOnce(&mut Lease),
    {
        let state = self.networks.get(network)?;
        let mut pool = state.pools.get(id.subnet)?.get(id.pool)?.lock();
        let lease = pool.leases.get_mut(&ip)?;
        mutate(lease);
        Some(lease.clone())
    }

    /// Reattach persisted leases into the pools whose ranges contain
    /// them. Records for unknown networks or addresses outside any pool
    /// are skipped.
    pub async fn load_persisted(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let mut loaded = 0usize;
        let mut orphaned = 0usize;
        store
            .for_each_lease(&mut |lease| {
                let Some((net, state)) = self.network(&lease.network) else {
                    orphaned += 1;
                    return;
                };
                let Some(id) = net.pool_of_ip(lease.ip) else {
                    orphaned += 1;
                    return;
                };
                let mut pool = state.pools[id.subnet][id.pool].lock();
                trace!(ip = %lease.ip, network = %lease.network, "loaded lease");
                pool.leases.insert(lease.ip, lease);
                loaded += 1;
            })
            .await?;
        if orphaned > 0 {
            debug!(orphaned, "skipped persisted leases outside configuration");
        }
        debug!(loaded, "reattached persisted leases");
        Ok(loaded)
    }

    /// Snapshot every lease in a network, both tracks.
    pub fn leases_in_network(&self, network: &str) -> Vec<Lease> {
        let Some(state) = self.networks.get(network) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for subnet in &state.pools {
            for lock in subnet {
                out.extend(lock.lock().leases.values().cloned());
            }
        }
        out
    }

    /// The grace window applied to a lease, by its own registered flag.
    fn grace_for(&self, registered: bool) -> Duration {
        self.cfg.global().free_lease_after(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
global
    server-identifier 10.0.0.5
    registered
        free-lease-after 172800
        default-lease-time 86400
    end
    unregistered
        free-lease-after 600
        default-lease-time 360
    end
end

network "network1"
    unregistered
        subnet 10.0.1.0/24
            range 10.0.1.10 10.0.1.12
        end
    end
    registered
        subnet 10.0.2.0/24
            range 10.0.2.10 10.0.2.12
        end
    end
end

network "network3"
    unregistered
        subnet 10.0.8.0/24
            pool
                range 10.0.8.10 10.0.8.12
            end
            pool
                range 10.0.8.120 10.0.8.122
            end
        end
    end
end
"#;

    fn manager() -> LeaseManager {
        LeaseManager::new(Arc::new(Config::parse_str(CONFIG).unwrap()))
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0x12, 0x34, 0x56, 0x12, 0x34, last)
    }

    #[test]
    fn free_lease_extends_into_unused_space() {
        let mgr = manager();
        let (a, _) = mgr.free_lease("network1", false).unwrap();
        assert_eq!(a.ip, Ipv4Addr::new(10, 0, 1, 10));
        assert!(!a.registered);
        assert_eq!(a.network, "network1");
    }

    #[test]
    fn tracks_are_disjoint() {
        let mgr = manager();
        let (unreg, _) = mgr.free_lease("network1", false).unwrap();
        let (reg, _) = mgr.free_lease("network1", true).unwrap();
        assert_eq!(unreg.ip, Ipv4Addr::new(10, 0, 1, 10));
        assert_eq!(reg.ip, Ipv4Addr::new(10, 0, 2, 10));
        assert!(reg.registered);
    }

    #[test]
    fn every_lease_stays_in_pool_range() {
        let mgr = manager();
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network3", false).unwrap();
            let hold = unix_now() + OFFER_HOLD_SECS;
            mgr.update_lease("network3", id, lease.ip, |l| {
                l.mac = mac(9);
                l.end = hold;
            });
        }
        for lease in mgr.leases_in_network("network3") {
            let net = mgr.config().network("network3").unwrap();
            let id = net.pool_of_ip(lease.ip).expect("lease outside any pool");
            assert!(net.subnets()[id.subnet].pools()[id.pool].contains(lease.ip));
        }
    }

    #[test]
    fn lease_by_mac_finds_bound_lease() {
        let mgr = manager();
        let (lease, id) = mgr.free_lease("network1", false).unwrap();
        mgr.update_lease("network1", id, lease.ip, |l| l.mac = mac(1));

        let (found, _) = mgr.lease_by_mac("network1", mac(1), false).unwrap();
        assert_eq!(found.ip, lease.ip);
        assert!(mgr.lease_by_mac("network1", mac(1), true).is_none());
        assert!(mgr.lease_by_mac("network1", mac(2), false).is_none());
    }

    #[test]
    fn lapsed_offer_is_recycled() {
        let mgr = manager();
        let now = unix_now();
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network1", false).unwrap();
            mgr.update_lease("network1", id, lease.ip, |l| {
                l.offered = true;
                l.mac = mac(7);
                // offer window already lapsed
                l.start = now - 60;
                l.end = now - 30;
            });
        }
        // pass B exhausted, pass A must clear a lapsed offer
        let (lease, _) = mgr.free_lease("network1", false).unwrap();
        assert!(!lease.offered);
    }

    #[test]
    fn grace_window_blocks_reuse() {
        let mgr = manager();
        let now = unix_now();
        // burn all three slots, expired but inside the 600s grace
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network1", false).unwrap();
            mgr.update_lease("network1", id, lease.ip, |l| {
                l.mac = mac(3);
                l.start = now - 400;
                l.end = now - 100;
            });
        }
        assert!(mgr.free_lease("network1", false).is_none());

        // push one lease past the grace window
        let target = Ipv4Addr::new(10, 0, 1, 11);
        let net_id = mgr
            .config()
            .network("network1")
            .unwrap()
            .pool_of_ip(target)
            .unwrap();
        mgr.update_lease("network1", net_id, target, |l| l.end = now - 601);
        let (lease, _) = mgr.free_lease("network1", false).unwrap();
        assert_eq!(lease.ip, target);
    }

    #[test]
    fn exhausted_pool_spills_into_next_pool() {
        let mgr = manager();
        let now = unix_now();
        // fill the first pool with leases still inside the grace window
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network3", false).unwrap();
            assert_eq!(id.pool, 0);
            mgr.update_lease("network3", id, lease.ip, |l| {
                l.mac = mac(5);
                l.start = now - 300;
                l.end = now - 10;
            });
        }
        let (lease, id) = mgr.free_lease("network3", false).unwrap();
        assert_eq!(id.pool, 1);
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 8, 120));
    }

    #[test]
    fn desperate_allocation_is_live() {
        let mgr = manager();
        let now = unix_now();
        // all slots active: desperate has nothing non-active
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network1", false).unwrap();
            mgr.update_lease("network1", id, lease.ip, |l| {
                l.mac = mac(8);
                l.end = now + 3600;
            });
        }
        assert!(mgr.free_lease("network1", false).is_none());
        assert!(mgr.free_lease_desperate("network1", false).is_none());

        // one expired-in-grace lease: normal allocation still refuses,
        // desperate must return it
        let target = Ipv4Addr::new(10, 0, 1, 12);
        let id = mgr
            .config()
            .network("network1")
            .unwrap()
            .pool_of_ip(target)
            .unwrap();
        mgr.update_lease("network1", id, target, |l| l.end = now - 5);
        assert!(mgr.free_lease("network1", false).is_none());
        let (lease, _) = mgr.free_lease_desperate("network1", false).unwrap();
        assert_eq!(lease.ip, target);
    }

    #[test]
    fn desperate_reclaims_abandoned_when_rest_is_active() {
        let mgr = manager();
        let now = unix_now();
        let mut ips = Vec::new();
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network1", false).unwrap();
            ips.push((lease.ip, id));
            mgr.update_lease("network1", id, lease.ip, |l| {
                l.mac = mac(8);
                l.end = now + 3600;
            });
        }
        let (abandoned_ip, id) = ips[1];
        mgr.update_lease("network1", id, abandoned_ip, |l| l.abandoned = true);

        let (lease, _) = mgr.free_lease_desperate("network1", false).unwrap();
        assert_eq!(lease.ip, abandoned_ip);
        assert!(!lease.abandoned);
    }

    #[test]
    fn abandoned_slots_are_skipped_by_normal_allocation() {
        let mgr = manager();
        for _ in 0..3 {
            let (lease, id) = mgr.free_lease("network1", false).unwrap();
            mgr.update_lease("network1", id, lease.ip, |l| l.abandoned = true);
        }
        assert!(mgr.free_lease("network1", false).is_none());
    }

    #[test]
    fn claim_reservation_rules() {
        let mgr = manager();
        let reserved = Ipv4Addr::new(10, 0, 2, 11);

        // fresh claim synthesises the slot
        let (lease, id) = mgr
            .claim_reservation("network1", reserved, mac(1), true)
            .unwrap();
        assert_eq!(lease.ip, reserved);

        // an active holder with a different MAC blocks the claim
        mgr.update_lease("network1", id, reserved, |l| {
            l.mac = mac(2);
            l.end = unix_now() + 3600;
        });
        assert!(mgr
            .claim_reservation("network1", reserved, mac(1), true)
            .is_none());
        // the holder itself may always reclaim
        assert!(mgr
            .claim_reservation("network1", reserved, mac(2), true)
            .is_some());
        // wrong track never matches
        assert!(mgr
            .claim_reservation("network1", reserved, mac(1), false)
            .is_none());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn load_persisted_reattaches_by_range() {
        use store::MemoryStore;

        let store = MemoryStore::new();
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 8, 121));
        lease.network = "network3".into();
        lease.mac = mac(4);
        lease.end = unix_now() + 600;
        store.put_lease(&lease).await.unwrap();

        // outside every pool: skipped
        let mut stray = Lease::new(Ipv4Addr::new(10, 0, 8, 200));
        stray.network = "network3".into();
        store.put_lease(&stray).await.unwrap();

        // unknown network: skipped
        let mut unknown = Lease::new(Ipv4Addr::new(10, 0, 1, 10));
        unknown.network = "gone".into();
        store.put_lease(&unknown).await.unwrap();

        let mgr = manager();
        let loaded = mgr.load_persisted(&store).await.unwrap();
        assert_eq!(loaded, 1);

        let (found, id) = mgr.lease_by_mac("network3", mac(4), false).unwrap();
        assert_eq!(found.ip, lease.ip);
        assert_eq!(id.pool, 1);
    }
}
