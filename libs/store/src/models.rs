//! Lease and device records, with the on-disk encodings used by the
//! embedded KV backend.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use pnet::util::MacAddr;

use crate::StoreError;

/// Epoch second used as the start/end sentinel of a released or declined
/// lease.
pub const RELEASED_AT: i64 = 1;

/// Current wall clock as epoch seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One IP address slot in one pool. Slots are created lazily when first
/// offered and reused forever after; they are never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    /// All-zero until the slot has been offered or assigned.
    pub mac: MacAddr,
    pub network: String,
    /// Epoch seconds.
    pub start: i64,
    /// Epoch seconds. `end <= start` only in the released/declined
    /// sentinel state.
    pub end: i64,
    pub hostname: String,
    pub abandoned: bool,
    pub offered: bool,
    pub registered: bool,
}

impl Lease {
    pub fn new(ip: Ipv4Addr) -> Self {
        Lease {
            ip,
            mac: MacAddr::zero(),
            network: String::new(),
            start: 0,
            end: 0,
            hostname: String::new(),
            abandoned: false,
            offered: false,
            registered: false,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.end < now
    }

    pub fn is_active(&self, now: i64) -> bool {
        !self.is_expired(now)
    }

    /// Encode for the KV backend. Layout (offsets in bytes):
    /// 0..4 IP, 4..10 MAC, 10 abandoned, 11 registered, 12..20 start,
    /// 20..28 end (both signed varints zero-padded to 8), 28 network name
    /// length, then the network name and finally the hostname, which runs
    /// to the end of the buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let net = self.network.as_bytes();
        let host = self.hostname.as_bytes();
        let mut buf = vec![0u8; 29 + net.len() + host.len()];

        buf[..4].copy_from_slice(&self.ip.octets());
        buf[4..10].copy_from_slice(&mac_octets(self.mac));
        buf[10] = self.abandoned as u8;
        buf[11] = self.registered as u8;
        put_varint(&mut buf[12..20], self.start);
        put_varint(&mut buf[20..28], self.end);
        buf[28] = net.len() as u8;
        let net_end = 29 + net.len();
        buf[29..net_end].copy_from_slice(net);
        buf[net_end..].copy_from_slice(host);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Lease, StoreError> {
        if data.len() < 29 {
            return Err(StoreError::Truncated(data.len()));
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let mac = MacAddr::new(data[4], data[5], data[6], data[7], data[8], data[9]);
        let net_len = data[28] as usize;
        if data.len() < 29 + net_len {
            return Err(StoreError::Truncated(data.len()));
        }
        let network = String::from_utf8_lossy(&data[29..29 + net_len]).into_owned();
        let hostname = String::from_utf8_lossy(&data[29 + net_len..]).into_owned();

        Ok(Lease {
            ip,
            mac,
            network,
            start: get_varint(&data[12..20]),
            end: get_varint(&data[20..28]),
            hostname,
            abandoned: data[10] == 1,
            offered: false,
            registered: data[11] == 1,
        })
    }
}

/// The administrative record for one MAC. A missing record is equivalent
/// to all-false flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub mac: MacAddr,
    pub registered: bool,
    pub blacklisted: bool,
    /// Epoch seconds, refreshed on every acknowledged REQUEST from a
    /// registered client. Not persisted by the KV backend.
    pub last_seen: i64,
}

impl Device {
    pub fn new(mac: MacAddr) -> Self {
        Device {
            mac,
            registered: false,
            blacklisted: false,
            last_seen: 0,
        }
    }

    /// Single-byte encoding: bit 1 registered, bit 0 blacklisted.
    pub fn state_byte(&self) -> u8 {
        ((self.registered as u8) << 1) | (self.blacklisted as u8)
    }

    pub fn from_state_byte(mac: MacAddr, state: u8) -> Self {
        Device {
            mac,
            registered: (state >> 1) & 1 == 1,
            blacklisted: state & 1 == 1,
            last_seen: 0,
        }
    }
}

pub(crate) fn mac_octets(mac: MacAddr) -> [u8; 6] {
    [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]
}

pub(crate) fn mac_from_octets(o: &[u8]) -> MacAddr {
    MacAddr::new(o[0], o[1], o[2], o[3], o[4], o[5])
}

/// Zig-zag varint into a zero-padded 8-byte field, matching Go's
/// `binary.PutVarint` into a fixed buffer.
fn put_varint(buf: &mut [u8], v: i64) {
    let mut ux = (v as u64) << 1;
    if v < 0 {
        ux = !ux;
    }
    let mut i = 0;
    while ux >= 0x80 {
        buf[i] = ux as u8 | 0x80;
        ux >>= 7;
        i += 1;
    }
    buf[i] = ux as u8;
}

fn get_varint(buf: &[u8]) -> i64 {
    let mut ux: u64 = 0;
    let mut shift = 0;
    for &b in buf {
        if b < 0x80 {
            ux |= (b as u64) << shift;
            break;
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    let x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        !x
    } else {
        x
    }
}
