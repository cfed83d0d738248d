//! DHCP option TLV stream handling.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Option codes the server knows by name. Anything else is carried as raw
/// bytes under its numeric code.
pub mod code {
    /// Pad, skipped when parsing
    pub const PAD: u8 = 0;
    /// Subnet mask (RFC 2132 §3.3)
    pub const SUBNET_MASK: u8 = 1;
    /// Router addresses
    pub const ROUTER: u8 = 3;
    /// Domain name servers
    pub const DOMAIN_NAME_SERVER: u8 = 6;
    /// Client host name
    pub const HOST_NAME: u8 = 12;
    /// Domain name
    pub const DOMAIN_NAME: u8 = 15;
    /// Broadcast address
    pub const BROADCAST_ADDRESS: u8 = 28;
    /// NTP servers
    pub const NTP_SERVERS: u8 = 42;
    /// Requested IP address (option 50)
    pub const REQUESTED_IP: u8 = 50;
    /// IP address lease time, 4-byte big-endian seconds
    pub const LEASE_TIME: u8 = 51;
    /// DHCP message type
    pub const MESSAGE_TYPE: u8 = 53;
    /// Server identifier
    pub const SERVER_IDENTIFIER: u8 = 54;
    /// Parameter request list
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    /// End of options marker
    pub const END: u8 = 255;
}

/// DHCP message types (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    /// Decode option 53's value byte. Types outside `Discover..Inform` are
    /// rejected.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }
}

/// A set of DHCP options keyed by code.
///
/// When built from the wire, repeated codes are joined by concatenation in
/// arrival order. When built from configuration, `set` replaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<u8, Vec<u8>>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TLV stream. Padding (0) is skipped, end (255) terminates,
    /// repeated codes concatenate. Truncated trailing options are dropped.
    pub fn parse(mut stream: &[u8]) -> Options {
        let mut opts = Options::new();
        while let Some((&c, rest)) = stream.split_first() {
            match c {
                code::PAD => stream = rest,
                code::END => break,
                _ => {
                    let Some((&len, rest)) = rest.split_first() else {
                        break;
                    };
                    let len = len as usize;
                    if rest.len() < len {
                        break;
                    }
                    opts.0.entry(c).or_default().extend_from_slice(&rest[..len]);
                    stream = &rest[len..];
                }
            }
        }
        opts
    }

    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.0.get(&code).map(Vec::as_slice)
    }

    /// Set an option, replacing any existing value.
    pub fn set(&mut self, code: u8, data: Vec<u8>) {
        self.0.insert(code, data);
    }

    /// Copy options from `other` that are not already present. This is the
    /// "child wins" half of scope inheritance.
    pub fn merge_missing(&mut self, other: &Options) {
        for (&c, v) in &other.0 {
            self.0.entry(c).or_insert_with(|| v.clone());
        }
    }

    pub fn contains(&self, code: u8) -> bool {
        self.0.contains_key(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.0.iter().map(|(c, v)| (*c, v.as_slice()))
    }

    /// The message type, if present and in range.
    pub fn msg_type(&self) -> Option<MessageType> {
        self.get(code::MESSAGE_TYPE)
            .and_then(|v| v.first().copied())
            .and_then(MessageType::from_byte)
    }

    /// Option 50, when it carries a full IPv4 address.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_ip(code::REQUESTED_IP)
    }

    /// Option 51, requested lease duration.
    pub fn requested_lease_time(&self) -> Option<Duration> {
        let v = self.get(code::LEASE_TIME)?;
        let secs: [u8; 4] = v.try_into().ok()?;
        Some(Duration::from_secs(u32::from_be_bytes(secs) as u64))
    }

    /// Interpret an option's value as a single IPv4 address.
    pub fn get_ip(&self, code: u8) -> Option<Ipv4Addr> {
        let v: [u8; 4] = self.get(code)?.try_into().ok()?;
        Some(Ipv4Addr::from(v))
    }

    /// Select options for a reply. With a parameter request list, produce
    /// the requested options in the order the client asked for them,
    /// followed by the subnet mask if the client forgot to ask (clients do).
    /// Without a list, produce everything in ascending code order.
    pub fn select_order_or_all(&self, params: Option<&[u8]>) -> Vec<(u8, Vec<u8>)> {
        match params {
            Some(list) => {
                let mut out: Vec<(u8, Vec<u8>)> = list
                    .iter()
                    .filter_map(|c| self.0.get(c).map(|v| (*c, v.clone())))
                    .collect();
                if !list.contains(&code::SUBNET_MASK) {
                    if let Some(mask) = self.0.get(&code::SUBNET_MASK) {
                        out.push((code::SUBNET_MASK, mask.clone()));
                    }
                }
                out
            }
            None => self.0.iter().map(|(c, v)| (*c, v.clone())).collect(),
        }
    }
}

impl FromIterator<(u8, Vec<u8>)> for Options {
    fn from_iter<T: IntoIterator<Item = (u8, Vec<u8>)>>(iter: T) -> Self {
        Options(iter.into_iter().collect())
    }
}
