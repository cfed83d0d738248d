//! Fixed-layout DHCPv4 packet header and reply construction.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

use crate::options::{code, MessageType, Options};

/// BOOTREQUEST opcode
pub const BOOT_REQUEST: u8 = 1;
/// BOOTREPLY opcode
pub const BOOT_REPLY: u8 = 2;

/// UDP port the server listens on
pub const SERVER_PORT: u16 = 67;
/// UDP port clients listen on
pub const CLIENT_PORT: u16 = 68;

/// A valid DHCP packet is at least the 236-byte header plus the 4-byte
/// magic cookie.
pub const MIN_PACKET_SIZE: usize = 240;
/// Replies are padded up to the BOOTP minimum.
const MIN_REPLY_SIZE: usize = 300;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const BROADCAST_FLAG: u16 = 0x8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("hardware address length {0} exceeds chaddr field")]
    BadHlen(u8),
    #[error("bad magic cookie")]
    BadCookie,
}

/// A decoded DHCPv4 packet. Option TLVs are kept raw and parsed on demand
/// with [`Packet::options`].
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    options: Vec<u8>,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("op", &self.op)
            .field("xid", &self.xid)
            .field("ciaddr", &self.ciaddr)
            .field("yiaddr", &self.yiaddr)
            .field("giaddr", &self.giaddr)
            .field("chaddr", &&self.chaddr[..self.hlen.min(16) as usize])
            .finish_non_exhaustive()
    }
}

fn read_ip(buf: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3])
}

impl Packet {
    /// Decode a datagram. Runts, over-long hardware addresses, and packets
    /// without the magic cookie are rejected; the caller discards them
    /// silently.
    pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(PacketError::TooShort(buf.len()));
        }
        let hlen = buf[2];
        if hlen > 16 {
            return Err(PacketError::BadHlen(hlen));
        }
        if buf[236..240] != MAGIC_COOKIE {
            return Err(PacketError::BadCookie);
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&buf[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&buf[108..236]);

        Ok(Packet {
            op: buf[0],
            htype: buf[1],
            hlen,
            hops: buf[3],
            xid: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            secs: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
            flags: u16::from_be_bytes(buf[10..12].try_into().unwrap()),
            ciaddr: read_ip(&buf[12..16]),
            yiaddr: read_ip(&buf[16..20]),
            siaddr: read_ip(&buf[20..24]),
            giaddr: read_ip(&buf[24..28]),
            chaddr,
            sname,
            file,
            options: buf[240..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_REPLY_SIZE.max(240 + self.options.len()));
        buf.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&self.options);
        if buf.len() < MIN_REPLY_SIZE {
            buf.resize(MIN_REPLY_SIZE, 0);
        }
        buf
    }

    /// Parse the option stream.
    pub fn options(&self) -> Options {
        Options::parse(&self.options)
    }

    /// The client hardware address, `hlen` bytes of `chaddr`.
    pub fn hardware_addr(&self) -> &[u8] {
        &self.chaddr[..self.hlen.min(16) as usize]
    }

    pub fn broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Build a reply to `req`. xid, flags, chaddr, and giaddr carry over;
    /// `yiaddr` is the assigned address (unspecified for INFORM replies and
    /// NAKs). The message type is encoded first, then the server
    /// identifier, the lease time when non-zero, the supplied options, and
    /// finally the end marker.
    pub fn reply(
        req: &Packet,
        msg_type: MessageType,
        server_id: Ipv4Addr,
        yiaddr: Ipv4Addr,
        lease: Duration,
        opts: &[(u8, Vec<u8>)],
    ) -> Packet {
        let mut stream = Vec::with_capacity(64);
        push_opt(&mut stream, code::MESSAGE_TYPE, &[msg_type as u8]);
        push_opt(&mut stream, code::SERVER_IDENTIFIER, &server_id.octets());
        if !lease.is_zero() {
            let secs = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);
            push_opt(&mut stream, code::LEASE_TIME, &secs.to_be_bytes());
        }
        for (c, v) in opts {
            push_opt(&mut stream, *c, v);
        }
        stream.push(code::END);

        Packet {
            op: BOOT_REPLY,
            htype: req.htype,
            hlen: req.hlen,
            hops: 0,
            xid: req.xid,
            secs: req.secs,
            flags: req.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: req.giaddr,
            chaddr: req.chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: stream,
        }
    }

    /// Build a client request. The server itself never sends one of these;
    /// tests and load drivers do.
    pub fn request(
        msg_type: MessageType,
        xid: u32,
        mac: &[u8],
        ciaddr: Option<Ipv4Addr>,
        broadcast: bool,
        opts: &[(u8, Vec<u8>)],
    ) -> Packet {
        let mut chaddr = [0u8; 16];
        let hlen = mac.len().min(16);
        chaddr[..hlen].copy_from_slice(&mac[..hlen]);

        let mut stream = Vec::with_capacity(64);
        push_opt(&mut stream, code::MESSAGE_TYPE, &[msg_type as u8]);
        for (c, v) in opts {
            push_opt(&mut stream, *c, v);
        }
        stream.push(code::END);

        Packet {
            op: BOOT_REQUEST,
            htype: 1,
            hlen: hlen as u8,
            hops: 0,
            xid,
            secs: 0,
            flags: if broadcast { BROADCAST_FLAG } else { 0 },
            ciaddr: ciaddr.unwrap_or(Ipv4Addr::UNSPECIFIED),
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: stream,
        }
    }
}

fn push_opt(stream: &mut Vec<u8>, code: u8, value: &[u8]) {
    if value.is_empty() {
        stream.push(code);
        stream.push(0);
        return;
    }
    // values longer than one TLV are split, receivers rejoin them
    for chunk in value.chunks(255) {
        stream.push(code);
        stream.push(chunk.len() as u8);
        stream.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mac() -> [u8; 6] {
        [0x12, 0x34, 0x56, 0x12, 0x34, 0x56]
    }

    #[test]
    fn rejects_runt_packet() {
        assert_eq!(
            Packet::decode(&[0u8; 239]),
            Err(PacketError::TooShort(239))
        );
    }

    #[test]
    fn rejects_oversize_hlen() {
        let mut buf = vec![0u8; 300];
        buf[2] = 17;
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);
        assert_eq!(Packet::decode(&buf), Err(PacketError::BadHlen(17)));
    }

    #[test]
    fn rejects_missing_cookie() {
        let buf = vec![0u8; 300];
        assert_eq!(Packet::decode(&buf), Err(PacketError::BadCookie));
    }

    #[test]
    fn request_round_trips() {
        let req = Packet::request(
            MessageType::Discover,
            0x1234_5678,
            &test_mac(),
            None,
            true,
            &[(code::PARAMETER_REQUEST_LIST, vec![1, 3, 6])],
        );
        let decoded = Packet::decode(&req.encode()).unwrap();
        assert_eq!(decoded.op, BOOT_REQUEST);
        assert_eq!(decoded.xid, 0x1234_5678);
        assert_eq!(decoded.hardware_addr(), &test_mac());
        assert!(decoded.broadcast());
        let opts = decoded.options();
        assert_eq!(opts.msg_type(), Some(MessageType::Discover));
        assert_eq!(opts.get(code::PARAMETER_REQUEST_LIST), Some(&[1, 3, 6][..]));
    }

    #[test]
    fn reply_preserves_request_identity() {
        let mut req = Packet::request(
            MessageType::Discover,
            0xdead_beef,
            &test_mac(),
            None,
            false,
            &[],
        );
        req.giaddr = Ipv4Addr::new(10, 0, 1, 5);

        let resp = Packet::reply(
            &req,
            MessageType::Offer,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 2, 10),
            Duration::from_secs(86_400),
            &[(code::ROUTER, vec![10, 0, 2, 1])],
        );
        assert_eq!(resp.op, BOOT_REPLY);
        assert_eq!(resp.xid, req.xid);
        assert_eq!(resp.giaddr, req.giaddr);
        assert_eq!(resp.chaddr, req.chaddr);
        assert_eq!(resp.yiaddr, Ipv4Addr::new(10, 0, 2, 10));

        let opts = resp.options();
        assert_eq!(opts.msg_type(), Some(MessageType::Offer));
        assert_eq!(opts.get(code::SERVER_IDENTIFIER), Some(&[10, 0, 0, 5][..]));
        assert_eq!(
            opts.get(code::LEASE_TIME),
            Some(&[0x00, 0x01, 0x51, 0x80][..])
        );
        assert_eq!(opts.get(code::ROUTER), Some(&[10, 0, 2, 1][..]));
    }

    #[test]
    fn reply_is_padded_to_bootp_minimum() {
        let req = Packet::request(MessageType::Request, 1, &test_mac(), None, false, &[]);
        let resp = Packet::reply(
            &req,
            MessageType::Nak,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::UNSPECIFIED,
            Duration::ZERO,
            &[],
        );
        let wire = resp.encode();
        assert!(wire.len() >= 300);
        // NAK carries no lease time
        assert!(!resp.options().contains(code::LEASE_TIME));
    }

    #[test]
    fn message_type_is_first_option_on_the_wire() {
        let req = Packet::request(MessageType::Request, 1, &test_mac(), None, false, &[]);
        let resp = Packet::reply(
            &req,
            MessageType::Ack,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 2, 10),
            Duration::from_secs(60),
            &[],
        );
        let wire = resp.encode();
        assert_eq!(wire[240], code::MESSAGE_TYPE);
        assert_eq!(wire[242], MessageType::Ack as u8);
    }
}
