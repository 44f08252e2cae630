use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use riptide_transport as transport;
use transport::{CompletionModeration, FourTupleFlow, RxStreamConfig, TxStreamConfig};

use mem::{DeviceIface, MemoryKind};

fn free_port() -> u16 {
    let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap().port()
}

/// A committed TX ring drains into an RX ring over loopback with packet
/// contents, ordering and counters intact.
#[test]
fn test_tx_to_rx_loopback() {
    let ctx = transport::initialize(transport::TransportConfig::default()).unwrap();
    let port = free_port();

    let mut rx = ctx
        .create_rx_stream(RxStreamConfig {
            nic: DeviceIface::from_local_ip(Ipv4Addr::LOCALHOST),
            capacity_packets: 256,
            payload_size: 512,
            header_size: 0,
            moderation: CompletionModeration {
                min_chunk: 1,
                max_chunk: 64,
                wait_timeout_ns: 1_000_000_000,
            },
            allocator: MemoryKind::Malloc,
            memory: None,
        })
        .unwrap();
    let flow = FourTupleFlow::new(42, Ipv4Addr::UNSPECIFIED, 0, Ipv4Addr::LOCALHOST, port);
    rx.attach_flow(&flow).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let mut tx = ctx
        .create_tx_stream(TxStreamConfig {
            local_ip: Ipv4Addr::LOCALHOST,
            destination: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            packets_per_chunk: 8,
            num_chunks: 4,
            max_packet_size: 512,
            packet_sizes: None,
            dscp: 0,
            memory: None,
        })
        .unwrap();

    // three chunks of eight packets, each tagged with its global index
    let mut sent = 0u8;
    for _ in 0..3 {
        let mut chunk = loop {
            match tx.get_next_chunk() {
                Ok(chunk) => break chunk,
                Err(e) if e.is_retryable() => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("get_next_chunk: {e}"),
            }
        };
        for i in 0..8 {
            let slot = chunk.packet_mut(i).unwrap();
            slot[0] = sent;
            slot[1] = 0x5A;
            chunk.set_packet_size(i, 16).unwrap();
            sent += 1;
        }
        loop {
            match tx.commit_chunk(0) {
                Ok(()) => break,
                Err(e) if e.is_retryable() => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("commit: {e}"),
            }
        }
    }

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 24 && Instant::now() < deadline {
        let completion = rx.get_next_chunk().unwrap();
        for packet in completion.iter() {
            assert_eq!(packet.payload.len(), 16);
            assert_eq!(packet.payload[1], 0x5A);
            assert_eq!(packet.flow_tag, 42);
            received.push(packet.payload[0]);
        }
        let n = completion.len();
        drop(completion);
        rx.release_packets(n).unwrap();
    }

    // loopback UDP preserves order, so the commit FIFO shows through
    assert_eq!(received, (0..24u8).collect::<Vec<_>>());
    assert_eq!(tx.stats().snapshot().sent_packets, 24);
    assert_eq!(rx.stats().snapshot().received_packets, 24);

    rx.detach_flow(&flow).unwrap();
    rx.destroy().unwrap();
    tx.destroy().unwrap();
    transport::cleanup();
}
