//! End-to-end handler scenarios against the reference configuration:
//! packets in, packets out, lease and device state checked in between.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use pnet::util::MacAddr;
use tracing_test::traced_test;

use config::Config;
use lease_manager::LeaseManager;
use proto::{code, MessageType, Packet};
use store::models::{unix_now, RELEASED_AT};
use store::{Device, MemoryStore, Store};
use warden_core::Handler;

const TEST_CONFIG: &str = r#"
global
    server-identifier 10.0.0.5
    option domain-name "example.com"

    registered
        free-lease-after 172800
        default-lease-time 86400
        max-lease-time 86400
    end

    unregistered
        free-lease-after 600
        default-lease-time 360
        max-lease-time 360
    end
end

network "network1"
    unregistered
        subnet 10.0.1.0/24
            option router 10.0.1.1
            option domain-name-server 10.0.0.1
            range 10.0.1.10 10.0.1.200
        end
    end
    registered
        subnet 10.0.2.0/24
            option router 10.0.2.1
            option domain-name-server 10.1.0.1 10.1.0.2
            range 10.0.2.10 10.0.2.200
        end
    end
end

network "network2"
    ignore-registration
    unregistered
        subnet 10.0.5.0/24
            option router 10.0.5.1
            range 10.0.5.10 10.0.5.200
        end
    end
end

network "network3"
    unregistered
        subnet 10.0.8.0/24
            option router 10.0.8.1
            pool
                range 10.0.8.10 10.0.8.100
            end
            pool
                range 10.0.8.120 10.0.8.250
            end
        end
    end
end

host "12:34:56:ab:cd:ef"
    fixed-address 10.0.2.42
    option domain-name-server 192.168.0.10
end
"#;

const PARAMS: [u8; 5] = [1, 3, 6, 15, 35];

struct TestServer {
    handler: Handler,
    store: Arc<MemoryStore>,
    leases: Arc<LeaseManager>,
}

fn setup(block_blacklist: bool) -> TestServer {
    let cfg = Arc::new(Config::parse_str(TEST_CONFIG).expect("test config must parse"));
    let store = Arc::new(MemoryStore::new());
    let leases = Arc::new(LeaseManager::new(Arc::clone(&cfg)));
    let handler = Handler::new(
        cfg,
        Arc::clone(&leases),
        Arc::clone(&store) as Arc<dyn Store>,
        block_blacklist,
    );
    TestServer {
        handler,
        store,
        leases,
    }
}

fn client_mac() -> MacAddr {
    MacAddr::new(0x12, 0x34, 0x56, 0x12, 0x34, 0x56)
}

fn mac_bytes(mac: MacAddr) -> [u8; 6] {
    [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]
}

async fn set_device(store: &MemoryStore, mac: MacAddr, registered: bool, blacklisted: bool) {
    store
        .put_device(&Device {
            mac,
            registered,
            blacklisted,
            last_seen: 0,
        })
        .await
        .unwrap();
}

fn relay_peer(giaddr: Ipv4Addr) -> SocketAddr {
    SocketAddr::new(giaddr.into(), proto::SERVER_PORT)
}

fn discover(mac: MacAddr, giaddr: Ipv4Addr) -> Packet {
    let mut pkt = Packet::request(
        MessageType::Discover,
        0x2983_4472,
        &mac_bytes(mac),
        None,
        false,
        &[(code::PARAMETER_REQUEST_LIST, PARAMS.to_vec())],
    );
    pkt.giaddr = giaddr;
    pkt
}

fn request_for(mac: MacAddr, giaddr: Ipv4Addr, offer: &Packet) -> Packet {
    let server_id = offer
        .options()
        .get(code::SERVER_IDENTIFIER)
        .expect("offer must carry server id")
        .to_vec();
    let mut pkt = Packet::request(
        MessageType::Request,
        0x2983_4473,
        &mac_bytes(mac),
        None,
        false,
        &[
            (code::PARAMETER_REQUEST_LIST, PARAMS.to_vec()),
            (code::SERVER_IDENTIFIER, server_id),
            (code::REQUESTED_IP, offer.yiaddr.octets().to_vec()),
        ],
    );
    pkt.giaddr = giaddr;
    pkt
}

async fn serve(srv: &TestServer, pkt: &Packet, peer: SocketAddr) -> Option<(Packet, SocketAddr)> {
    srv.handler.serve(&pkt.encode(), peer).await
}

#[track_caller]
fn check_option(resp: &Packet, code: u8, expected: &[u8]) {
    let opts = resp.options();
    assert_eq!(
        opts.get(code),
        Some(expected),
        "option {code} mismatch in {opts:?}"
    );
}

#[tokio::test]
#[traced_test]
async fn registered_discover_then_request() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, true, false).await;

    let (offer, dst) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("registered discover must be answered");
    assert_eq!(dst, relay_peer(relay));
    assert_eq!(offer.options().msg_type(), Some(MessageType::Offer));
    assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 2, 10));
    check_option(&offer, code::SUBNET_MASK, &[255, 255, 255, 0]);
    check_option(&offer, code::ROUTER, &[10, 0, 2, 1]);
    check_option(&offer, code::DOMAIN_NAME_SERVER, &[10, 1, 0, 1, 10, 1, 0, 2]);
    check_option(&offer, code::DOMAIN_NAME, b"example.com");
    check_option(&offer, code::LEASE_TIME, &[0x00, 0x01, 0x51, 0x80]);

    // the offered slot is held for the client, but not persisted
    let now = unix_now();
    let (lease, _) = srv.leases.lease_by_mac("network1", mac, true).unwrap();
    assert!(lease.offered);
    assert!(lease.end > now && lease.end <= now + 30);
    assert!(srv.store.get_lease(offer.yiaddr).await.unwrap().is_none());

    let (ack, _) = serve(&srv, &request_for(mac, relay, &offer), relay_peer(relay))
        .await
        .expect("request after offer must be acked");
    assert_eq!(ack.options().msg_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr, offer.yiaddr);
    check_option(&ack, code::ROUTER, &[10, 0, 2, 1]);
    check_option(&ack, code::LEASE_TIME, &[0x00, 0x01, 0x51, 0x80]);

    // committed: persisted, bound to the client, clock-skew padded
    let stored = srv.store.get_lease(ack.yiaddr).await.unwrap().unwrap();
    assert_eq!(stored.mac, mac);
    assert!(!stored.offered);
    let expected_end = unix_now() + 86_400 + 10;
    assert!((stored.end - expected_end).abs() <= 2);

    // registered clients get their last-seen refreshed on ACK
    let device = srv.store.get_device(mac).await.unwrap();
    assert!(device.last_seen > 0);
}

#[tokio::test]
#[traced_test]
async fn unregistered_discover_then_request() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, false, false).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("unregistered discover must be answered");
    assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 1, 10));
    check_option(&offer, code::SUBNET_MASK, &[255, 255, 255, 0]);
    check_option(&offer, code::ROUTER, &[10, 0, 1, 1]);
    check_option(&offer, code::DOMAIN_NAME_SERVER, &[10, 0, 0, 1]);
    check_option(&offer, code::DOMAIN_NAME, b"example.com");
    check_option(&offer, code::LEASE_TIME, &[0x00, 0x00, 0x01, 0x68]);

    let (ack, _) = serve(&srv, &request_for(mac, relay, &offer), relay_peer(relay))
        .await
        .expect("request after offer must be acked");
    assert_eq!(ack.yiaddr, offer.yiaddr);
    check_option(&ack, code::ROUTER, &[10, 0, 1, 1]);
    check_option(&ack, code::LEASE_TIME, &[0x00, 0x00, 0x01, 0x68]);
}

#[tokio::test]
#[traced_test]
async fn blacklisted_client_is_dropped() {
    let srv = setup(true);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, true, true).await;

    let resp = serve(&srv, &discover(mac, relay), relay_peer(relay)).await;
    assert!(resp.is_none(), "blacklisted client must get no reply");
}

#[tokio::test]
#[traced_test]
async fn blacklisted_client_served_as_unregistered_when_not_blocked() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, true, true).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("unblocked blacklisted client is served");
    // registered flag is overridden by the blacklist
    assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 1, 10));
}

#[tokio::test]
#[traced_test]
async fn exhausted_first_pool_spills_into_second() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 8, 5);
    set_device(&srv.store, mac, false, false).await;

    // fill the first pool with leases expired but inside the
    // unregistered grace window
    let filler = MacAddr::new(0xaa, 0xbb, 0xcc, 0, 0, 1);
    let now = unix_now();
    for _ in 0..91 {
        let (lease, id) = srv
            .leases
            .free_lease("network3", false)
            .expect("first pool must still have room");
        assert_eq!(id.pool, 0);
        srv.leases.update_lease("network3", id, lease.ip, |l| {
            l.mac = filler;
            l.start = now - 300;
            l.end = now - 10;
        });
    }

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("second pool must serve the client");
    assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 8, 120));
}

#[tokio::test]
#[traced_test]
async fn release_then_rediscover_same_ip() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, false, false).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .unwrap();
    let (ack, _) = serve(&srv, &request_for(mac, relay, &offer), relay_peer(relay))
        .await
        .unwrap();
    let ip = ack.yiaddr;

    let release = {
        let mut pkt = Packet::request(
            MessageType::Release,
            0x2983_4474,
            &mac_bytes(mac),
            Some(ip),
            false,
            &[],
        );
        pkt.giaddr = relay;
        pkt
    };
    let resp = serve(&srv, &release, relay_peer(relay)).await;
    assert!(resp.is_none(), "RELEASE never gets a reply");

    // sentinel times, persisted
    let stored = srv.store.get_lease(ip).await.unwrap().unwrap();
    assert_eq!(stored.start, RELEASED_AT);
    assert_eq!(stored.end, RELEASED_AT);

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("released client discovers again");
    assert_eq!(offer.yiaddr, ip, "client re-receives the released address");
}

#[tokio::test]
#[traced_test]
async fn decline_abandons_lease() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, false, false).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .unwrap();
    let (ack, _) = serve(&srv, &request_for(mac, relay, &offer), relay_peer(relay))
        .await
        .unwrap();
    let ip = ack.yiaddr;

    // disputed address in option 50, ciaddr zero, as modern clients do
    let decline = {
        let mut pkt = Packet::request(
            MessageType::Decline,
            0x2983_4475,
            &mac_bytes(mac),
            None,
            false,
            &[(code::REQUESTED_IP, ip.octets().to_vec())],
        );
        pkt.giaddr = relay;
        pkt
    };
    let resp = serve(&srv, &decline, relay_peer(relay)).await;
    assert!(resp.is_none(), "DECLINE never gets a reply");

    let stored = srv.store.get_lease(ip).await.unwrap().unwrap();
    assert!(stored.abandoned);
    assert_eq!(stored.start, RELEASED_AT);
    assert_eq!(stored.end, RELEASED_AT);

    // the abandoned address is not offered to the next client
    let other = MacAddr::new(0x66, 0x55, 0x44, 0x33, 0x22, 0x11);
    set_device(&srv.store, other, false, false).await;
    let (next_offer, _) = serve(&srv, &discover(other, relay), relay_peer(relay))
        .await
        .unwrap();
    assert_ne!(next_offer.yiaddr, ip);
}

#[tokio::test]
#[traced_test]
async fn inform_returns_options_only() {
    let srv = setup(false);
    let mac = client_mac();
    set_device(&srv.store, mac, true, false).await;

    let inform = Packet::request(
        MessageType::Inform,
        0x2983_4476,
        &mac_bytes(mac),
        Some(Ipv4Addr::new(10, 0, 2, 15)),
        false,
        &[(code::PARAMETER_REQUEST_LIST, PARAMS.to_vec())],
    );
    let peer: SocketAddr = "10.0.2.15:68".parse().unwrap();
    let (ack, dst) = serve(&srv, &inform, peer).await.expect("INFORM gets an ACK");
    assert_eq!(ack.options().msg_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
    assert!(ack.options().get(code::LEASE_TIME).is_none());
    check_option(&ack, code::ROUTER, &[10, 0, 2, 1]);
    // ciaddr set, no broadcast flag: unicast back to the client
    assert_eq!(dst, "10.0.2.15:68".parse().unwrap());
}

#[tokio::test]
#[traced_test]
async fn request_for_foreign_lease_naks() {
    let srv = setup(false);
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    let owner = client_mac();
    let thief = MacAddr::new(0x66, 0x55, 0x44, 0x33, 0x22, 0x11);
    set_device(&srv.store, owner, false, false).await;
    set_device(&srv.store, thief, false, false).await;

    let (offer, _) = serve(&srv, &discover(owner, relay), relay_peer(relay))
        .await
        .unwrap();

    let (nak, _) = serve(&srv, &request_for(thief, relay, &offer), relay_peer(relay))
        .await
        .expect("stolen request must be NAKed");
    assert_eq!(nak.options().msg_type(), Some(MessageType::Nak));
    assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
}

#[tokio::test]
#[traced_test]
async fn request_for_unknown_lease_naks() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, false, false).await;

    // seed the gateway cache
    serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .unwrap();

    let mut pkt = Packet::request(
        MessageType::Request,
        0x2983_4477,
        &mac_bytes(mac),
        None,
        false,
        &[(
            code::REQUESTED_IP,
            Ipv4Addr::new(10, 0, 1, 99).octets().to_vec(),
        )],
    );
    pkt.giaddr = relay;
    let (nak, _) = serve(&srv, &pkt, relay_peer(relay))
        .await
        .expect("unknown lease must be NAKed");
    assert_eq!(nak.options().msg_type(), Some(MessageType::Nak));
}

#[tokio::test]
#[traced_test]
async fn request_for_other_server_is_ignored() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, false, false).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .unwrap();

    let mut pkt = Packet::request(
        MessageType::Request,
        0x2983_4478,
        &mac_bytes(mac),
        None,
        false,
        &[
            (code::SERVER_IDENTIFIER, vec![192, 168, 99, 1]),
            (code::REQUESTED_IP, offer.yiaddr.octets().to_vec()),
        ],
    );
    pkt.giaddr = relay;
    let resp = serve(&srv, &pkt, relay_peer(relay)).await;
    assert!(resp.is_none(), "requests for other servers are dropped");
}

#[tokio::test]
#[traced_test]
async fn discover_from_unknown_relay_is_dropped() {
    let srv = setup(false);
    let mac = client_mac();
    set_device(&srv.store, mac, false, false).await;

    let relay = Ipv4Addr::new(192, 168, 50, 1);
    let resp = serve(&srv, &discover(mac, relay), relay_peer(relay)).await;
    assert!(resp.is_none());
}

#[tokio::test]
#[traced_test]
async fn ignore_registration_serves_registered_from_unregistered_track() {
    let srv = setup(false);
    let mac = client_mac();
    let relay = Ipv4Addr::new(10, 0, 5, 1);
    set_device(&srv.store, mac, true, false).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("network2 must serve despite registration");
    assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 5, 10));
    check_option(&offer, code::ROUTER, &[10, 0, 5, 1]);
    // unregistered track timings apply
    check_option(&offer, code::LEASE_TIME, &[0x00, 0x00, 0x01, 0x68]);
}

#[tokio::test]
#[traced_test]
async fn host_block_reservation_and_option_overlay() {
    let srv = setup(false);
    let mac: MacAddr = "12:34:56:ab:cd:ef".parse().unwrap();
    let relay = Ipv4Addr::new(10, 0, 1, 5);
    set_device(&srv.store, mac, true, false).await;

    let (offer, _) = serve(&srv, &discover(mac, relay), relay_peer(relay))
        .await
        .expect("host with reservation must be served");
    assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 2, 42));
    // host options win over the pool walk, everything else flows through
    check_option(&offer, code::DOMAIN_NAME_SERVER, &[192, 168, 0, 10]);
    check_option(&offer, code::ROUTER, &[10, 0, 2, 1]);
}

#[tokio::test]
#[traced_test]
async fn runt_and_malformed_packets_are_discarded() {
    let srv = setup(false);
    let peer: SocketAddr = "10.0.1.5:67".parse().unwrap();

    assert!(srv.handler.serve(&[0u8; 100], peer).await.is_none());

    // valid length, hlen too large
    let mut buf = discover(client_mac(), Ipv4Addr::new(10, 0, 1, 5)).encode();
    buf[2] = 17;
    assert!(srv.handler.serve(&buf, peer).await.is_none());

    // message type out of range
    let mut pkt = Packet::request(
        MessageType::Discover,
        1,
        &mac_bytes(client_mac()),
        None,
        false,
        &[],
    );
    pkt.giaddr = Ipv4Addr::new(10, 0, 1, 5);
    let mut buf = pkt.encode();
    // first option after the cookie is the message type TLV
    buf[242] = 9;
    assert!(srv.handler.serve(&buf, peer).await.is_none());
}
