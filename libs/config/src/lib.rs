//! # config
//!
//! The declarative network configuration: a lexer and parser for the
//! scope DSL, and the resulting scope tree (global → network → subnet →
//! pool, plus per-MAC host overrides) with inherited option values and
//! lease timings.
//!
//! ```text
//! global
//!     server-identifier 10.0.0.5
//!     option domain-name "example.com"
//!     registered
//!         default-lease-time 86400
//!     end
//!     unregistered
//!         default-lease-time 360
//!     end
//! end
//!
//! network "network1"
//!     unregistered
//!         subnet 10.0.1.0/24
//!             option router 10.0.1.1
//!             range 10.0.1.10 10.0.1.200
//!         end
//!     end
//!     registered
//!         subnet 10.0.2.0/24
//!             option router 10.0.2.1
//!             range 10.0.2.10 10.0.2.200
//!         end
//!     end
//! end
//! ```
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
use std::path::{Path, PathBuf};

use pnet::util::MacAddr;
use thiserror::Error;
use tracing::debug;

mod lexer;
mod parser;
pub mod scope;
pub mod settings;
mod tokens;

pub use scope::{Global, Host, Network, Pool, PoolId, Scope, Subnet};
pub use settings::Settings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("i/o error reading config")]
    Io(#[from] std::io::Error),
    #[error("invalid token {found} on line {line}")]
    InvalidToken { found: String, line: u32 },
    #[error("unexpected token {found} on line {line} in {context}")]
    UnexpectedToken {
        found: String,
        line: u32,
        context: &'static str,
    },
    #[error("expected {expected} on line {line}")]
    Expected { expected: &'static str, line: u32 },
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("network {name} already declared, line {line}")]
    DuplicateNetwork { name: String, line: u32 },
    #[error("host {mac} already declared, line {line}")]
    DuplicateHost { mac: String, line: u32 },
    #[error("invalid hardware address {mac:?} on line {line}")]
    BadMac { mac: String, line: u32 },
    #[error("option {name} is not supported, line {line}")]
    UnknownOption { name: String, line: u32 },
    #[error("option code {code} out of range on line {line}")]
    BadOptionCode { code: i64, line: u32 },
    #[error("range redeclared on line {0}")]
    RangeRedeclared(u32),
    #[error("pool has no range, ending on line {0}")]
    MissingRange(u32),
    #[error("range start after end ({start} > {end}) on line {line}")]
    BadRange {
        start: Ipv4Addr,
        end: Ipv4Addr,
        line: u32,
    },
    #[error("invalid netmask {mask} on line {line}")]
    BadNetmask { mask: Ipv4Addr, line: u32 },
    #[error("pool {start}-{end} outside subnet {subnet}, line {line}")]
    PoolOutsideSubnet {
        subnet: ipnet::Ipv4Net,
        start: Ipv4Addr,
        end: Ipv4Addr,
        line: u32,
    },
    #[error("pool ranges overlap in subnet {subnet}, line {line}")]
    OverlappingPools { subnet: ipnet::Ipv4Net, line: u32 },
    #[error("include cycle detected at {}", .0.display())]
    IncludeCycle(PathBuf),
}

impl ConfigError {
    fn in_file(path: PathBuf, err: ConfigError) -> ConfigError {
        match err {
            // innermost file attribution wins
            err @ ConfigError::File { .. } => err,
            err => ConfigError::File {
                path,
                source: Box::new(err),
            },
        }
    }
}

/// The parsed scope tree. Immutable once built; lease state lives
/// elsewhere.
#[derive(Debug)]
pub struct Config {
    pub(crate) global: Global,
    pub(crate) networks: HashMap<String, Network>,
    pub(crate) hosts: HashMap<MacAddr, Host>,
}

impl Config {
    /// Parse a configuration file, following `include` directives
    /// relative to it.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::in_file(path.to_owned(), err.into()))?;
        let mut parser = parser::Parser::new();
        let mut stack = vec![path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())];
        parser
            .parse_source(&src, Some(path), &mut stack)
            .map_err(|err| ConfigError::in_file(path.to_owned(), err))?;
        let cfg = parser.into_config();
        debug!(
            networks = cfg.networks.len(),
            hosts = cfg.hosts.len(),
            "parsed configuration"
        );
        Ok(cfg)
    }

    /// Parse configuration text. `include` directives resolve relative to
    /// the working directory.
    pub fn parse_str(src: &str) -> Result<Config, ConfigError> {
        let mut parser = parser::Parser::new();
        parser.parse_source(src, None, &mut Vec::new())?;
        Ok(parser.into_config())
    }

    pub fn global(&self) -> &Global {
        &self.global
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.get(&name.to_lowercase())
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.networks.keys().cloned().collect()
    }

    pub fn host(&self, mac: MacAddr) -> Option<&Host> {
        self.hosts.get(&mac)
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&MacAddr, &Host)> {
        self.hosts.iter()
    }

    /// Find the network serving `ip`: the one whose subnets contain it,
    /// or a `local` network when `ip` is zero (a client on the server's
    /// own segment).
    pub fn find_network(&self, ip: Ipv4Addr) -> Option<&Network> {
        self.networks
            .values()
            .find(|n| (ip.is_unspecified() && n.local) || n.includes(ip))
    }
}
