use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use riptide_ipo as ipo;

use ipo::{IpoPathConfig, IpoStream, IpoStreamConfig};
use mem::MemoryKind;
use transport::{CompletionModeration, FourTupleFlow};

fn context() -> std::sync::Arc<transport::TransportContext> {
    transport::initialize(transport::TransportConfig::default())
        .or_else(|_| transport::context())
        .unwrap()
}

fn free_port() -> u16 {
    let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap().port()
}

fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 32];
    packet[0] = 0x80;
    packet[1] = 96;
    packet[2..4].copy_from_slice(&seq.to_be_bytes());
    packet[12] = seq as u8; // payload marker byte
    packet
}

fn stream_config(ports: &[u16]) -> IpoStreamConfig {
    IpoStreamConfig {
        paths: ports
            .iter()
            .enumerate()
            .map(|(i, &port)| IpoPathConfig {
                local_ip: Ipv4Addr::LOCALHOST,
                flow: FourTupleFlow::new(
                    i as u32,
                    Ipv4Addr::UNSPECIFIED,
                    0,
                    Ipv4Addr::LOCALHOST,
                    port,
                ),
            })
            .collect(),
        max_path_differential: Duration::from_millis(50),
        extended_sequence: false,
        capacity_packets: 4096,
        payload_size: 256,
        header_size: 0,
        register_memory: false,
        allocator: MemoryKind::Malloc,
        moderation: CompletionModeration {
            min_chunk: 0,
            max_chunk: 1024,
            wait_timeout_ns: 5_000_000,
        },
        packet_interval_ns: 1_000_000,
    }
}

/// Two paths with disjoint ~10% loss each: the engine emits every
/// sequence number exactly once, in order, with the duplicate copies
/// accounted as redundant and nothing lost.
#[test]
fn test_two_path_seamless_merge() {
    let ctx = context();
    let ports = [free_port(), free_port()];
    let mut stream = IpoStream::new(&ctx, stream_config(&ports)).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let total = 200u16;
    let mut sent_a = 0u64;
    let mut sent_b = 0u64;
    for seq in 0..total {
        let packet = rtp_packet(seq);
        // disjoint loss patterns, with the very first packet on both
        // paths so the cold start is unambiguous
        if seq % 10 != 0 || seq == 0 {
            sender
                .send_to(&packet, (Ipv4Addr::LOCALHOST, ports[0]))
                .unwrap();
            sent_a += 1;
        }
        if seq % 10 != 5 {
            sender
                .send_to(&packet, (Ipv4Addr::LOCALHOST, ports[1]))
                .unwrap();
            sent_b += 1;
        }
    }

    let mut emitted: Vec<u64> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while emitted.len() < total as usize && Instant::now() < deadline {
        let collected = &mut emitted;
        stream
            .poll(&mut |packet| {
                assert_eq!(packet.payload[12], packet.sequence as u8);
                collected.push(packet.sequence);
            })
            .unwrap();
    }

    assert_eq!(emitted, (0..total as u64).collect::<Vec<_>>(), "zero gaps");
    let stats = stream.stats();
    assert_eq!(stats.unique, total as u64);
    assert_eq!(stats.lost_after_window, 0);
    assert_eq!(stats.redundant, sent_a + sent_b - total as u64);
    assert_eq!(stats.received_total(), sent_a + sent_b);
    // per-path bookkeeping saw the disjoint gaps
    assert_eq!(stats.path_dropped.len(), 2);
    assert!(stats.path_dropped[0] > 0);
    assert!(stats.path_dropped[1] > 0);

    stream.destroy().unwrap();
}

/// Registration without header-data split is refused up front.
#[test]
fn test_register_memory_requires_hds() {
    let ctx = context();
    let mut config = stream_config(&[free_port()]);
    config.register_memory = true;
    let err = IpoStream::new(&ctx, config).unwrap_err();
    assert!(matches!(err, util::Error::InvalidArgument(_)));
}

/// Registered regions are balanced out by destroy.
#[test]
fn test_destroy_deregisters_memory() {
    let ctx = context();
    let mut config = stream_config(&[free_port()]);
    config.register_memory = true;
    config.header_size = 12;
    let before = mem::registration_balance();
    let stream = IpoStream::new(&ctx, config).unwrap();
    assert!(mem::registration_balance() > before);
    stream.destroy().unwrap();
    assert_eq!(mem::registration_balance(), before);
}
