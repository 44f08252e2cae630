use std::net::Ipv4Addr;
use std::time::Duration;

use riptide::config::{ipo_receiver_command, IpoReceiverArgs};
use riptide::report::{ReportedStream, StatsReporter};
use riptide::{exit_code, EXIT_USAGE};

use ipo::{IpoPathConfig, IpoStream, IpoStreamConfig};
use transport::{CompletionModeration, FourTupleFlow, TransportConfig};
use util::clock::Clock;
use util::{Error, Result};

fn main() {
    env_logger::init();
    let matches = ipo_receiver_command().get_matches();
    let args = match IpoReceiverArgs::from_matches(&matches) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_USAGE);
        }
    };

    if let Err(e) = util::shutdown::install_signal_handlers() {
        eprintln!("failed to install signal handlers: {e}");
    }

    let result = run(args);
    transport::cleanup();
    util::shutdown::run_finalizers();
    std::process::exit(exit_code(&result));
}

/// Per-stream flow fan-out: stream `s` takes each path's destination
/// address with the last octet advanced by `s * paths`, matching the
/// address plan of the redundant sender.
fn stream_flows(args: &IpoReceiverArgs, stream_index: usize) -> Vec<IpoPathConfig> {
    let paths = args.local_ips.len();
    (0..paths)
        .map(|p| {
            let base = args.dst_ips[p].octets();
            let last = (base[3] as usize + stream_index * paths) % 256;
            let dst = Ipv4Addr::new(base[0], base[1], base[2], last as u8);
            IpoPathConfig {
                local_ip: args.local_ips[p],
                flow: FourTupleFlow::new(
                    (stream_index * paths + p) as u32,
                    args.src_ips[p],
                    0,
                    dst,
                    args.dst_ports[p],
                ),
            }
        })
        .collect()
}

fn run(args: IpoReceiverArgs) -> Result<()> {
    let ctx = transport::initialize(TransportConfig {
        clock: Clock::system_tai(),
        internal_core: args.internal_core,
    })?;

    // build every stream up front so memory sizing and registration
    // happen before any traffic is served
    let mut streams = Vec::with_capacity(args.streams);
    for stream_index in 0..args.streams {
        let stream = IpoStream::new(
            &ctx,
            IpoStreamConfig {
                paths: stream_flows(&args, stream_index),
                max_path_differential: Duration::from_micros(args.max_path_differential_us),
                extended_sequence: args.extended_sequence,
                capacity_packets: args.packets,
                payload_size: args.payload_size,
                header_size: args.header_size,
                register_memory: args.register_memory,
                allocator: args.allocator,
                moderation: CompletionModeration {
                    min_chunk: 0,
                    max_chunk: 5000,
                    wait_timeout_ns: if args.wait_event { 10_000_000 } else { 0 },
                },
                packet_interval_ns: 1_000_000,
            },
        )?;
        streams.push(stream);
    }

    let reported = streams
        .iter()
        .enumerate()
        .flat_map(|(s, stream)| {
            stream
                .path_stream_stats()
                .into_iter()
                .enumerate()
                .map(move |(p, stats)| ReportedStream {
                    name: format!("stream{s}/path{p}"),
                    stats,
                })
        })
        .collect();
    let mut reporter = StatsReporter::new(reported, false);

    // distribute the streams round-robin over the receiver threads
    let mut buckets: Vec<Vec<IpoStream>> = (0..args.threads).map(|_| Vec::new()).collect();
    for (index, stream) in streams.into_iter().enumerate() {
        buckets[index % args.threads].push(stream);
    }

    let mut workers = Vec::new();
    for (thread_index, bucket) in buckets.into_iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let core = args.application_cores[thread_index % args.application_cores.len()];
        let sleep_us = args.sleep_us;
        workers.push(
            std::thread::Builder::new()
                .name(format!("ipo-recv-{thread_index}"))
                .spawn(move || receiver_thread(bucket, core, sleep_us))
                .map_err(|e| Error::Io(format!("spawning receiver thread: {e}")))?,
        );
    }

    while !util::shutdown::exit_requested() {
        reporter.tick();
        std::thread::sleep(Duration::from_millis(100));
    }

    let mut result = Ok(());
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) | Ok(Err(Error::Signal)) => {}
            Ok(Err(e)) => result = Err(e),
            Err(_) => result = Err(Error::Io("receiver thread panicked".into())),
        }
    }
    result
}

fn receiver_thread(mut streams: Vec<IpoStream>, core: i64, sleep_us: u64) -> Result<()> {
    util::affinity::pin_current_to_core(core)?;
    let mut delivered: u64 = 0;
    // a fatal stream error tears that stream out of the rotation
    // without affecting the others
    let mut alive = vec![true; streams.len()];
    let run_result = loop {
        if util::shutdown::exit_requested() {
            break Ok(());
        }
        for (index, stream) in streams.iter_mut().enumerate() {
            if !alive[index] {
                continue;
            }
            match stream.poll(&mut |_packet| {
                delivered += 1;
            }) {
                Ok(()) => {}
                Err(Error::Signal) => {}
                Err(e) => {
                    log::error!("ipo stream failed, removing it: {e}");
                    alive[index] = false;
                }
            }
        }
        if sleep_us > 0 {
            std::thread::sleep(Duration::from_micros(sleep_us));
        }
    };

    for stream in streams {
        let stats = stream.stats();
        log::info!(
            "ipo stream done: {} unique, {} redundant, {} late, {} lost, {delivered} delivered",
            stats.unique,
            stats.redundant,
            stats.late_drops,
            stats.lost_after_window
        );
        stream.destroy()?;
    }
    run_result
}
