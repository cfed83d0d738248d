//! # warden-core
//!
//! The DHCP server proper: the UDP worker loop, the
//! DISCOVER/REQUEST/RELEASE/DECLINE/INFORM state machine that turns
//! packets into lease mutations and on-wire replies, and the management
//! operations exposed over the external API.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod handler;
pub mod management;
pub mod server;

pub use handler::Handler;
pub use management::Management;
pub use server::Server;
