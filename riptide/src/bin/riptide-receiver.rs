use std::time::Duration;

use riptide::checksum::ChecksumVerifier;
use riptide::config::{receiver_command, ReceiverArgs};
use riptide::report::{ReportedStream, StatsReporter};
use riptide::{exit_code, EXIT_USAGE};

use mem::DeviceIface;
use transport::{CompletionModeration, FourTupleFlow, RxStreamConfig, TransportConfig};
use util::clock::Clock;
use util::{Error, Result};

fn main() {
    env_logger::init();
    let matches = receiver_command().get_matches();
    let args = match ReceiverArgs::from_matches(&matches) {
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

fn run(args: ReceiverArgs) -> Result<()> {
    let ctx = transport::initialize(TransportConfig {
        clock: Clock::system_tai(),
        internal_core: util::affinity::CPU_NONE,
    })?;

    if !args.cpu_affinity.is_empty() {
        let mask = util::affinity::CpuMask::from_cores(&args.cpu_affinity)?;
        util::affinity::pin_current_to_cpus(&mask)?;
    }

    let mut stream = ctx.create_rx_stream(RxStreamConfig {
        nic: DeviceIface::from_local_ip(args.interface_ip),
        capacity_packets: args.packets,
        payload_size: args.payload_size,
        header_size: args.header_size,
        moderation: CompletionModeration {
            min_chunk: 0,
            max_chunk: 5000,
            wait_timeout_ns: if args.wait_event { 100_000_000 } else { 0 },
        },
        allocator: args.allocator,
        memory: None,
    })?;

    let flow = FourTupleFlow::new(
        args.flow_tag,
        args.src_address,
        0,
        args.dst_address,
        args.port,
    );
    stream.attach_flow(&flow)?;

    let stats = stream.stats();
    let mut verifier = args
        .checksum_header
        .then(|| ChecksumVerifier::new(stats.clone()));
    let mut reporter = StatsReporter::new(
        vec![ReportedStream {
            name: "rx".into(),
            stats,
        }],
        args.checksum_header,
    );

    log::info!("running main receive loop");
    let result = receive_loop(&mut stream, &mut verifier, &mut reporter, &args);

    stream.detach_flow(&flow)?;
    stream.destroy()?;
    match result {
        // a signal ends the loop but the run still succeeded
        Err(Error::Signal) => Ok(()),
        other => other,
    }
}

fn receive_loop(
    stream: &mut transport::RxStream,
    verifier: &mut Option<ChecksumVerifier>,
    reporter: &mut StatsReporter,
    args: &ReceiverArgs,
) -> Result<()> {
    loop {
        if util::shutdown::exit_requested() {
            return Ok(());
        }
        let count = {
            let completion = stream.get_next_chunk()?;
            if let Some(verifier) = verifier.as_mut() {
                for packet in completion.iter() {
                    verifier.verify(packet.header, packet.payload);
                }
            }
            completion.len()
        };
        stream.release_packets(count)?;
        reporter.tick();
        if count == 0 && !args.wait_event && args.sleep_us > 0 {
            std::thread::sleep(Duration::from_micros(args.sleep_us));
        }
    }
}
