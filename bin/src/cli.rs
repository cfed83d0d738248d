//! Parse from either cli or env var

use std::net::SocketAddr;
use std::path::PathBuf;

pub use clap::Parser;

/// default listen address, the dhcpv4 server port is 67
pub static DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:67";
/// default management api address
pub static DEFAULT_API_ADDR: &str = "0.0.0.0:3333";
/// the default path to the network configuration
pub static DEFAULT_CONFIG_PATH: &str = "/etc/warden/networks.conf";
/// default log level. Can use this argument or WARDEN_LOG env var
pub static DEFAULT_WARDEN_LOG: &str = "info";
/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "warden-dhcp-worker";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "warden", bin_name = "warden", about, long_about = None)]
/// parses from cli & environment var
pub struct Config {
    /// path to the network configuration
    #[clap(short, long, value_parser, env, default_value = DEFAULT_CONFIG_PATH)]
    pub config_path: PathBuf,
    /// the address to listen on for dhcp
    #[clap(long, env, value_parser, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: SocketAddr,
    /// the management api address
    #[clap(long, env, value_parser, default_value = DEFAULT_API_ADDR)]
    pub api_addr: SocketAddr,
    /// path to the lease database. Leases are kept in memory only when
    /// unset
    #[clap(short, long, env, value_parser)]
    pub database_path: Option<PathBuf>,
    /// number of packet workers, 0 means one per hardware thread
    #[clap(long, env, value_parser, default_value_t = 0)]
    pub workers: usize,
    /// drop all traffic from blacklisted clients
    #[clap(long, env, value_parser, default_value_t = false)]
    pub block_blacklist: bool,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env, value_parser, default_value = DEFAULT_WARDEN_LOG)]
    pub warden_log: String,
    /// check the configuration, then exit
    #[clap(short = 't', long, value_parser, default_value_t = false)]
    pub check_config: bool,
}
