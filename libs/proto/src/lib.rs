//! # proto
//!
//! DHCPv4 wire format (RFC 2131/2132): the fixed-layout packet header, the
//! TLV option stream that follows the magic cookie, and the reply
//! construction rules the server uses for OFFER/ACK/NAK.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod options;
pub mod packet;

pub use options::{code, MessageType, Options};
pub use packet::{Packet, PacketError, CLIENT_PORT, SERVER_PORT};
