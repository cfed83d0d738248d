//! The scope tree: global → network → subnet → pool, plus host overrides.
//!
//! The tree is immutable once parsed and shared read-only between request
//! workers. Settings resolution walks child → parent with "child wins"
//! semantics for options and nearest-non-zero semantics for durations;
//! resolved values are memoised per (scope, registered) in `OnceLock`
//! cells so repeat lookups cost one load.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;

use ipnet::Ipv4Net;
use proto::Options;

use crate::settings::Settings;

fn idx(registered: bool) -> usize {
    registered as usize
}

/// Server-wide scope: the server identifier, base settings, and the
/// registered/unregistered overlays that seed the two address tracks.
#[derive(Debug)]
pub struct Global {
    pub(crate) server_identifier: Ipv4Addr,
    pub(crate) settings: Settings,
    pub(crate) registered_settings: Settings,
    pub(crate) unregistered_settings: Settings,
    pub(crate) merged: [OnceLock<Options>; 2],
}

impl Default for Global {
    fn default() -> Self {
        Global {
            server_identifier: Ipv4Addr::UNSPECIFIED,
            settings: Settings::default(),
            registered_settings: Settings::default(),
            unregistered_settings: Settings::default(),
            merged: Default::default(),
        }
    }
}

impl Global {
    pub fn server_identifier(&self) -> Ipv4Addr {
        self.server_identifier
    }

    fn bucket(&self, registered: bool) -> &Settings {
        if registered {
            &self.registered_settings
        } else {
            &self.unregistered_settings
        }
    }

    pub(crate) fn default_lease_time(&self, registered: bool) -> Duration {
        let d = self.bucket(registered).default_lease_time;
        if !d.is_zero() {
            d
        } else {
            self.settings.default_lease_time
        }
    }

    pub(crate) fn max_lease_time(&self, registered: bool) -> Duration {
        let d = self.bucket(registered).max_lease_time;
        if !d.is_zero() {
            d
        } else {
            self.settings.max_lease_time
        }
    }

    /// Grace window after expiry during which an address stays reserved
    /// for its previous holder. Read from the track overlays only.
    pub fn free_lease_after(&self, registered: bool) -> Duration {
        self.bucket(registered).free_lease_after
    }

    pub(crate) fn effective_options(&self, registered: bool) -> &Options {
        self.merged[idx(registered)].get_or_init(|| {
            let mut opts = self.bucket(registered).options.clone();
            opts.merge_missing(&self.settings.options);
            opts
        })
    }
}

/// A named network: one or more subnets split into registered and
/// unregistered tracks.
#[derive(Debug)]
pub struct Network {
    pub(crate) name: String,
    pub(crate) local: bool,
    pub(crate) ignore_registration: bool,
    pub(crate) settings: Settings,
    pub(crate) registered_settings: Settings,
    pub(crate) unregistered_settings: Settings,
    pub(crate) subnets: Vec<Subnet>,
    pub(crate) merged: [OnceLock<Options>; 2],
    pub(crate) default_lease: [OnceLock<Duration>; 2],
    pub(crate) max_lease: [OnceLock<Duration>; 2],
}

impl Network {
    pub(crate) fn new(name: String) -> Self {
        Network {
            name,
            local: false,
            ignore_registration: false,
            settings: Settings::default(),
            registered_settings: Settings::default(),
            unregistered_settings: Settings::default(),
            subnets: Vec::new(),
            merged: Default::default(),
            default_lease: Default::default(),
            max_lease: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serves clients on the server's own segment (zero giaddr).
    pub fn local(&self) -> bool {
        self.local
    }

    /// Treat every client as unregistered on this network.
    pub fn ignore_registration(&self) -> bool {
        self.ignore_registration
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub fn includes(&self, ip: Ipv4Addr) -> bool {
        self.subnets.iter().any(|s| s.includes(ip))
    }

    /// Locate the pool whose range holds `ip`, across both tracks.
    pub fn pool_of_ip(&self, ip: Ipv4Addr) -> Option<PoolId> {
        for (si, subnet) in self.subnets.iter().enumerate() {
            for (pi, pool) in subnet.pools.iter().enumerate() {
                if pool.contains(ip) {
                    return Some(PoolId {
                        subnet: si,
                        pool: pi,
                    });
                }
            }
        }
        None
    }

    /// Bundle the inheritance chain for one pool.
    pub fn scope<'a>(&'a self, global: &'a Global, id: PoolId) -> Option<Scope<'a>> {
        let subnet = self.subnets.get(id.subnet)?;
        let pool = subnet.pools.get(id.pool)?;
        Some(Scope {
            global,
            network: self,
            subnet,
            pool,
        })
    }

    fn bucket(&self, registered: bool) -> &Settings {
        if registered {
            &self.registered_settings
        } else {
            &self.unregistered_settings
        }
    }

    pub(crate) fn default_lease_time(&self, global: &Global, registered: bool) -> Duration {
        *self.default_lease[idx(registered)].get_or_init(|| {
            let overlay = self.bucket(registered).default_lease_time;
            if !overlay.is_zero() {
                overlay
            } else if !self.settings.default_lease_time.is_zero() {
                self.settings.default_lease_time
            } else {
                global.default_lease_time(registered)
            }
        })
    }

    pub(crate) fn max_lease_time(&self, global: &Global, registered: bool) -> Duration {
        *self.max_lease[idx(registered)].get_or_init(|| {
            let overlay = self.bucket(registered).max_lease_time;
            if !overlay.is_zero() {
                overlay
            } else if !self.settings.max_lease_time.is_zero() {
                self.settings.max_lease_time
            } else {
                global.max_lease_time(registered)
            }
        })
    }

    pub(crate) fn effective_options(&self, global: &Global, registered: bool) -> &Options {
        self.merged[idx(registered)].get_or_init(|| {
            let mut opts = self.bucket(registered).options.clone();
            opts.merge_missing(&self.settings.options);
            opts.merge_missing(global.effective_options(registered));
            opts
        })
    }
}

/// One CIDR worth of address space inside a network. `allow_unknown`
/// subnets serve unregistered clients, the rest serve registered ones.
#[derive(Debug)]
pub struct Subnet {
    pub(crate) cidr: Ipv4Net,
    pub(crate) allow_unknown: bool,
    pub(crate) settings: Settings,
    pub(crate) pools: Vec<Pool>,
    pub(crate) merged: [OnceLock<Options>; 2],
    pub(crate) default_lease: [OnceLock<Duration>; 2],
    pub(crate) max_lease: [OnceLock<Duration>; 2],
}

impl Subnet {
    pub(crate) fn new(cidr: Ipv4Net) -> Self {
        Subnet {
            cidr,
            allow_unknown: false,
            settings: Settings::default(),
            pools: Vec::new(),
            merged: Default::default(),
            default_lease: Default::default(),
            max_lease: Default::default(),
        }
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    pub fn allow_unknown(&self) -> bool {
        self.allow_unknown
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn includes(&self, ip: Ipv4Addr) -> bool {
        self.cidr.contains(&ip)
    }

    fn default_lease_time(&self, network: &Network, global: &Global, registered: bool) -> Duration {
        *self.default_lease[idx(registered)].get_or_init(|| {
            if !self.settings.default_lease_time.is_zero() {
                self.settings.default_lease_time
            } else {
                network.default_lease_time(global, registered)
            }
        })
    }

    fn max_lease_time(&self, network: &Network, global: &Global, registered: bool) -> Duration {
        *self.max_lease[idx(registered)].get_or_init(|| {
            if !self.settings.max_lease_time.is_zero() {
                self.settings.max_lease_time
            } else {
                network.max_lease_time(global, registered)
            }
        })
    }

    fn effective_options(&self, network: &Network, global: &Global, registered: bool) -> &Options {
        self.merged[idx(registered)].get_or_init(|| {
            let mut opts = self.settings.options.clone();
            opts.merge_missing(network.effective_options(global, registered));
            opts
        })
    }
}

/// A contiguous, inclusive address range leases are drawn from.
#[derive(Debug)]
pub struct Pool {
    pub(crate) range_start: Ipv4Addr,
    pub(crate) range_end: Ipv4Addr,
    pub(crate) settings: Settings,
    pub(crate) merged: [OnceLock<Options>; 2],
    pub(crate) default_lease: [OnceLock<Duration>; 2],
    pub(crate) max_lease: [OnceLock<Duration>; 2],
}

impl Pool {
    pub(crate) fn new(range_start: Ipv4Addr, range_end: Ipv4Addr) -> Self {
        Pool {
            range_start,
            range_end,
            settings: Settings::default(),
            merged: Default::default(),
            default_lease: Default::default(),
            max_lease: Default::default(),
        }
    }

    pub fn range_start(&self) -> Ipv4Addr {
        self.range_start
    }

    pub fn range_end(&self) -> Ipv4Addr {
        self.range_end
    }

    /// Number of addresses in the inclusive range.
    pub fn size(&self) -> u32 {
        u32::from(self.range_end) - u32::from(self.range_start) + 1
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.range_start..=self.range_end).contains(&ip)
    }

    /// The address `offset` slots into the range, if still inside it.
    pub fn ip_at(&self, offset: u32) -> Option<Ipv4Addr> {
        let ip = u32::from(self.range_start).checked_add(offset)?;
        if ip > u32::from(self.range_end) {
            return None;
        }
        Some(Ipv4Addr::from(ip))
    }
}

/// Identifies a pool within its network: subnet index, pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub subnet: usize,
    pub pool: usize,
}

/// The full inheritance chain for one pool, the unit the handler works
/// with once a lease has been placed.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub global: &'a Global,
    pub network: &'a Network,
    pub subnet: &'a Subnet,
    pub pool: &'a Pool,
}

impl<'a> Scope<'a> {
    /// Resolve the lease duration for a request. A zero `requested` yields
    /// the nearest non-zero default walking pool → subnet → network →
    /// global; otherwise the request is capped at the nearest non-zero
    /// maximum (uncapped if none is configured anywhere).
    pub fn lease_time(&self, requested: Duration, registered: bool) -> Duration {
        if requested.is_zero() {
            return *self.pool.default_lease[idx(registered)].get_or_init(|| {
                if !self.pool.settings.default_lease_time.is_zero() {
                    self.pool.settings.default_lease_time
                } else {
                    self.subnet
                        .default_lease_time(self.network, self.global, registered)
                }
            });
        }
        let max = *self.pool.max_lease[idx(registered)].get_or_init(|| {
            if !self.pool.settings.max_lease_time.is_zero() {
                self.pool.settings.max_lease_time
            } else {
                self.subnet
                    .max_lease_time(self.network, self.global, registered)
            }
        });
        if max.is_zero() {
            requested
        } else {
            requested.min(max)
        }
    }

    /// The fully merged option set for this pool, memoised at the pool.
    /// Once a code is set at a lower scope, a higher scope cannot
    /// overwrite it.
    pub fn options(&self, registered: bool) -> &'a Options {
        self.pool.merged[idx(registered)].get_or_init(|| {
            let mut opts = self.pool.settings.options.clone();
            opts.merge_missing(self.subnet.effective_options(
                self.network,
                self.global,
                registered,
            ));
            opts
        })
    }

    pub fn free_lease_after(&self, registered: bool) -> Duration {
        self.global.free_lease_after(registered)
    }
}

/// Per-MAC overrides: options overlaid on top of the pool walk, plus an
/// optional fixed address.
#[derive(Debug, Default)]
pub struct Host {
    pub(crate) settings: Settings,
    pub(crate) fixed_address: Option<Ipv4Addr>,
}

impl Host {
    pub fn options(&self) -> &Options {
        &self.settings.options
    }

    pub fn fixed_address(&self) -> Option<Ipv4Addr> {
        self.fixed_address
    }
}
