//! Two engines as mutual peers over an in-memory datagram link, run with
//! their full worker stacks.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use wirecore::{
    ChannelInterface, ChannelTransport, DatagramTransport, Engine, EngineConfig, InterfaceHandle,
    PeerConfig,
};

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, total_len: usize) -> Vec<u8> {
    assert!(total_len >= 20);
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    for (i, byte) in packet[20..].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    packet
}

fn config(
    private: [u8; 32],
    peer_public: [u8; 32],
    peer_net: &str,
    endpoint: SocketAddr,
    rate_limit: u64,
) -> EngineConfig {
    EngineConfig {
        private_key: private,
        listen_port: None,
        mtu: 1420,
        peers: vec![PeerConfig {
            public_key: peer_public,
            preshared_key: Some([0x5Au8; 32]),
            allowed_ips: vec![peer_net.parse().unwrap()],
            endpoint: Some(endpoint),
            persistent_keepalive: None,
        }],
        handshake_rate_limit: rate_limit,
    }
}

struct Node {
    engine: Arc<Engine>,
    host: InterfaceHandle,
    workers: wirecore::EngineHandle,
}

async fn start_pair(rate_limit: u64) -> (Node, Node) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("wirecore=debug")
        .with_test_writer()
        .try_init();

    let (a_priv, a_pub) = wirecore::crypto::x25519::generate_keypair();
    let (b_priv, b_pub) = wirecore::crypto::x25519::generate_keypair();

    let addr_a: SocketAddr = "10.99.0.1:51820".parse().unwrap();
    let addr_b: SocketAddr = "10.99.0.2:51820".parse().unwrap();
    let (transport_a, transport_b) = ChannelTransport::pair(addr_a, addr_b);

    let engine_a = Engine::new(
        config(a_priv, b_pub, "10.0.0.2/32", addr_b, rate_limit),
        Arc::new(transport_a) as Arc<dyn DatagramTransport>,
    )
    .await
    .unwrap();
    let engine_b = Engine::new(
        config(b_priv, a_pub, "10.0.0.1/32", addr_a, rate_limit),
        Arc::new(transport_b) as Arc<dyn DatagramTransport>,
    )
    .await
    .unwrap();

    let (iface_a, host_a) = ChannelInterface::create();
    let (iface_b, host_b) = ChannelInterface::create();

    let workers_a = engine_a.start(Arc::new(iface_a));
    let workers_b = engine_b.start(Arc::new(iface_b));

    (
        Node {
            engine: engine_a,
            host: host_a,
            workers: workers_a,
        },
        Node {
            engine: engine_b,
            host: host_b,
            workers: workers_b,
        },
    )
}

async fn expect_delivery(host: &InterfaceHandle, within: Duration) -> Vec<u8> {
    tokio::time::timeout(within, host.next_delivered())
        .await
        .expect("packet not delivered in time")
        .unwrap()
}

#[tokio::test]
async fn full_tunnel_round_trip_at_mtu() -> anyhow::Result<()> {
    let (a, b) = start_pair(10).await;

    // First packet triggers the handshake; it must come out the far side
    // well inside the retry budget
    let outbound = ipv4_packet("10.0.0.1".parse()?, "10.0.0.2".parse()?, 1400);
    a.host.inject(outbound.clone()).await?;
    assert_eq!(expect_delivery(&b.host, Duration::from_secs(5)).await, outbound);

    // And straight back over the established session
    let inbound = ipv4_packet("10.0.0.2".parse()?, "10.0.0.1".parse()?, 1400);
    b.host.inject(inbound.clone()).await?;
    assert_eq!(expect_delivery(&a.host, Duration::from_secs(5)).await, inbound);

    let report = a.engine.report_runtime_state().await;
    assert!(report.contains("latest handshake"));

    a.workers.stop().await;
    b.workers.stop().await;
    Ok(())
}

#[tokio::test]
async fn burst_of_packets_before_handshake_all_arrive_in_order() {
    let (a, b) = start_pair(10).await;

    let packets: Vec<Vec<u8>> = (0..20)
        .map(|i| {
            ipv4_packet(
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                100 + i,
            )
        })
        .collect();
    for packet in &packets {
        a.host.inject(packet.clone()).await.unwrap();
    }

    for expected in &packets {
        let got = expect_delivery(&b.host, Duration::from_secs(5)).await;
        assert_eq!(&got, expected);
    }

    a.workers.stop().await;
    b.workers.stop().await;
}

#[tokio::test]
async fn tunnel_established_through_cookie_exchange() {
    // A zero load threshold forces the responder to demand a cookie on
    // every initiation, so the tunnel only comes up if the cookie round
    // trip works end to end
    let (a, b) = start_pair(0).await;

    let outbound = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 600);
    a.host.inject(outbound.clone()).await.unwrap();
    assert_eq!(expect_delivery(&b.host, Duration::from_secs(10)).await, outbound);

    a.workers.stop().await;
    b.workers.stop().await;
}

#[tokio::test]
async fn shutdown_is_prompt() {
    let (a, b) = start_pair(10).await;

    let packet = ipv4_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 200);
    a.host.inject(packet.clone()).await.unwrap();
    expect_delivery(&b.host, Duration::from_secs(5)).await;

    a.engine.clear_sessions().await;

    tokio::time::timeout(Duration::from_secs(6), async {
        a.workers.stop().await;
        b.workers.stop().await;
    })
    .await
    .expect("shutdown exceeded its bound");
}
