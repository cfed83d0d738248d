//! Pool occupancy statistics for the management surface.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use store::models::unix_now;

use crate::LeaseManager;

/// One row per pool. Each lease lands in exactly one category, evaluated
/// in order: abandoned, active, claimed (expired but inside the grace
/// window), free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStat {
    pub network: String,
    pub subnet: Ipv4Net,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub registered: bool,
    pub total: u32,
    pub active: u32,
    pub claimed: u32,
    pub abandoned: u32,
    pub free: u32,
}

impl LeaseManager {
    pub fn pool_stats(&self) -> Vec<PoolStat> {
        let now = unix_now();
        let reg_grace = self.grace_for(true).as_secs() as i64;
        let unreg_grace = self.grace_for(false).as_secs() as i64;

        let mut out = Vec::new();
        for network in self.config().networks() {
            let Some(state) = self.networks.get(network.name()) else {
                continue;
            };
            for (si, subnet) in network.subnets().iter().enumerate() {
                for (pi, pool_cfg) in subnet.pools().iter().enumerate() {
                    let mut stat = PoolStat {
                        network: network.name().to_owned(),
                        subnet: subnet.cidr(),
                        range_start: pool_cfg.range_start(),
                        range_end: pool_cfg.range_end(),
                        registered: !subnet.allow_unknown(),
                        total: pool_cfg.size(),
                        active: 0,
                        claimed: 0,
                        abandoned: 0,
                        free: 0,
                    };
                    let pool = state.pools[si][pi].lock();
                    for lease in pool.leases.values() {
                        if lease.abandoned {
                            stat.abandoned += 1;
                        } else if lease.is_active(now) {
                            stat.active += 1;
                        } else {
                            let grace = if lease.registered {
                                reg_grace
                            } else {
                                unreg_grace
                            };
                            if lease.end + grace > now {
                                stat.claimed += 1;
                            } else {
                                stat.free += 1;
                            }
                        }
                    }
                    out.push(stat);
                }
            }
        }
        out
    }
}
