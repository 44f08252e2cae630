use std::net::Ipv4Addr;
use std::str::FromStr;

use clap::{Arg, ArgMatches, Command};

use mem::MemoryKind;
use rtp::params::{PixelFormat, Scan};
use util::affinity::CPU_NONE;
use util::clock::{parse_frame_rate, ClockSource, DEFAULT_LEAP_SECONDS};
use util::{Error, Rational, Result};

pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.parse()
        .map_err(|_| Error::invalid_argument(format!("bad IPv4 address {s:?}")))
}

pub fn parse_csv<T: FromStr>(s: &str, what: &str) -> Result<Vec<T>> {
    s.split(',')
        .map(|item| {
            item.trim()
                .parse::<T>()
                .map_err(|_| Error::invalid_argument(format!("bad {what} entry {item:?}")))
        })
        .collect()
}

pub fn parse_allocator(s: &str, gpu_id: Option<u32>) -> Result<MemoryKind> {
    match s {
        "malloc" => Ok(MemoryKind::Malloc),
        "huge" => Ok(MemoryKind::HugePages { page_size: None }),
        "huge1g" => Ok(MemoryKind::HugePages {
            page_size: Some(1024 * 1024 * 1024),
        }),
        "gpu" => match gpu_id {
            Some(device) => Ok(MemoryKind::Gpu { device }),
            None => Err(Error::invalid_argument("--allocator-type gpu needs --gpu-id")),
        },
        other => Err(Error::invalid_argument(format!(
            "unknown allocator type {other:?}"
        ))),
    }
}

pub fn parse_clock(matches: &ArgMatches) -> Result<ClockSource> {
    match matches.value_of("clock").unwrap_or("system") {
        "system" => Ok(ClockSource::SystemTai {
            leap_seconds: DEFAULT_LEAP_SECONDS,
        }),
        "ptp" => Ok(ClockSource::Ptp {
            device: matches
                .value_of("ptp-device")
                .unwrap_or("/dev/ptp0")
                .to_string(),
        }),
        other => Err(Error::invalid_argument(format!(
            "unknown clock source {other:?}"
        ))),
    }
}

fn common_rx_args(command: Command<'static>) -> Command<'static> {
    command
        .arg(
            Arg::new("packets")
                .short('k')
                .long("packets")
                .takes_value(true)
                .default_value("262144")
                .help("Number of packets to allocate ring memory for"),
        )
        .arg(
            Arg::new("payload-size")
                .short('y')
                .long("payload-size")
                .takes_value(true)
                .default_value("1500")
                .help("User data (payload) size"),
        )
        .arg(
            Arg::new("app-hdr-size")
                .long("app-hdr-size")
                .takes_value(true)
                .default_value("0")
                .help("Application header size; non-zero enables header-data split"),
        )
        .arg(
            Arg::new("allocator-type")
                .long("allocator-type")
                .takes_value(true)
                .default_value("huge")
                .help("Memory allocator: malloc, huge, huge1g or gpu"),
        )
        .arg(
            Arg::new("gpu-id")
                .short('g')
                .long("gpu-id")
                .takes_value(true)
                .help("GPU for GPUDirect payload memory"),
        )
        .arg(
            Arg::new("lock-gpu-clocks")
                .long("lock-gpu-clocks")
                .takes_value(false)
                .help("Lock GPU clocks at maximum rate"),
        )
        .arg(
            Arg::new("wait-event")
                .short('w')
                .long("wait-event")
                .takes_value(false)
                .help("Wait for packets instead of busy polling"),
        )
        .arg(
            Arg::new("sleep-us")
                .long("sleep-us")
                .takes_value(true)
                .default_value("0")
                .help("Polling sleep between empty completions, microseconds"),
        )
}

/// `riptide-receiver` — single-flow packet receiver with optional
/// checksum-header verification.
pub fn receiver_command() -> Command<'static> {
    common_rx_args(
        Command::new("riptide-receiver")
            .about("Generic packet-level receiver")
            .arg(
                Arg::new("interface-ip")
                    .short('i')
                    .long("interface-ip")
                    .takes_value(true)
                    .required(true)
                    .help("IP of the local NIC interface"),
            )
            .arg(
                Arg::new("dst-address")
                    .short('m')
                    .long("dst-address")
                    .takes_value(true)
                    .required(true)
                    .help("Destination address to steer"),
            )
            .arg(
                Arg::new("src-address")
                    .short('s')
                    .long("src-address")
                    .takes_value(true)
                    .required(true)
                    .help("Source address filter"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .takes_value(true)
                    .required(true)
                    .help("Destination port"),
            )
            .arg(
                Arg::new("flow-id")
                    .short('f')
                    .long("flow-id")
                    .takes_value(true)
                    .default_value("1")
                    .help("Flow tag"),
            )
            .arg(
                Arg::new("checksum-header")
                    .short('x')
                    .long("checksum-header")
                    .takes_value(false)
                    .conflicts_with("app-hdr-size")
                    .help("Verify the sequence/checksum app header"),
            )
            .arg(
                Arg::new("cpu-affinity")
                    .short('a')
                    .long("cpu-affinity")
                    .takes_value(true)
                    .help("Comma separated CPU list for the receive loop"),
            ),
    )
}

#[derive(Debug, Clone)]
pub struct ReceiverArgs {
    pub interface_ip: Ipv4Addr,
    pub dst_address: Ipv4Addr,
    pub src_address: Ipv4Addr,
    pub port: u16,
    pub flow_tag: u32,
    pub packets: usize,
    pub payload_size: usize,
    pub header_size: usize,
    pub checksum_header: bool,
    pub wait_event: bool,
    pub sleep_us: u64,
    pub allocator: MemoryKind,
    pub cpu_affinity: Vec<usize>,
}

impl ReceiverArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let gpu_id = matches
            .value_of("gpu-id")
            .map(|s| parse_number::<u32>(s, "gpu id"))
            .transpose()?;
        let checksum_header = matches.is_present("checksum-header");
        let header_size = if checksum_header {
            crate::checksum::CHECKSUM_HEADER_SIZE
        } else {
            parse_number(matches.value_of("app-hdr-size").unwrap_or("0"), "header size")?
        };
        Ok(ReceiverArgs {
            interface_ip: parse_ipv4(required(matches, "interface-ip")?)?,
            dst_address: parse_ipv4(required(matches, "dst-address")?)?,
            src_address: parse_ipv4(required(matches, "src-address")?)?,
            port: parse_number(required(matches, "port")?, "port")?,
            flow_tag: parse_number(matches.value_of("flow-id").unwrap_or("1"), "flow id")?,
            packets: parse_number(matches.value_of("packets").unwrap_or("65536"), "packets")?,
            payload_size: parse_number(
                matches.value_of("payload-size").unwrap_or("1500"),
                "payload size",
            )?,
            header_size,
            checksum_header,
            wait_event: matches.is_present("wait-event"),
            sleep_us: parse_number(matches.value_of("sleep-us").unwrap_or("0"), "sleep")?,
            allocator: parse_allocator(
                matches.value_of("allocator-type").unwrap_or("huge"),
                gpu_id,
            )?,
            cpu_affinity: matches
                .value_of("cpu-affinity")
                .map(|s| parse_csv(s, "cpu"))
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// `riptide-ipo-receiver` — N-path seamless protection receiver.
pub fn ipo_receiver_command() -> Command<'static> {
    common_rx_args(
        Command::new("riptide-ipo-receiver")
            .about("Inline packet ordering receiver")
            .arg(
                Arg::new("local-ips")
                    .long("local-ips")
                    .takes_value(true)
                    .required(true)
                    .help("Comma separated NIC addresses, one per path"),
            )
            .arg(
                Arg::new("src-ips")
                    .long("src-ips")
                    .takes_value(true)
                    .required(true)
                    .help("Comma separated source addresses, one per path"),
            )
            .arg(
                Arg::new("dst-ips")
                    .long("dst-ips")
                    .takes_value(true)
                    .required(true)
                    .help("Comma separated destination addresses, one per path"),
            )
            .arg(
                Arg::new("dst-ports")
                    .short('p')
                    .long("dst-ports")
                    .takes_value(true)
                    .required(true)
                    .help("Comma separated destination ports, one per path"),
            )
            .arg(
                Arg::new("threads")
                    .short('t')
                    .long("threads")
                    .takes_value(true)
                    .default_value("1")
                    .help("Receiver threads"),
            )
            .arg(
                Arg::new("streams")
                    .short('n')
                    .long("streams")
                    .takes_value(true)
                    .default_value("1")
                    .help("Ordering streams to run"),
            )
            .arg(
                Arg::new("internal-core")
                    .short('i')
                    .long("internal-core")
                    .takes_value(true)
                    .default_value("-1")
                    .help("CPU core of the transport workers"),
            )
            .arg(
                Arg::new("application-core")
                    .short('a')
                    .long("application-core")
                    .takes_value(true)
                    .help("Comma separated CPU cores for receiver threads"),
            )
            .arg(
                Arg::new("max-pd")
                    .short('D')
                    .long("max-pd")
                    .takes_value(true)
                    .default_value("50000")
                    .help("Maximum path differential, microseconds"),
            )
            .arg(
                Arg::new("ext-seq-num")
                    .short('X')
                    .long("ext-seq-num")
                    .takes_value(false)
                    .help("Parse the extended sequence number from the payload"),
            )
            .arg(
                Arg::new("register-memory")
                    .long("register-memory")
                    .takes_value(false)
                    .help("Register application memory with each path's NIC"),
            ),
    )
}

#[derive(Debug, Clone)]
pub struct IpoReceiverArgs {
    pub local_ips: Vec<Ipv4Addr>,
    pub src_ips: Vec<Ipv4Addr>,
    pub dst_ips: Vec<Ipv4Addr>,
    pub dst_ports: Vec<u16>,
    pub threads: usize,
    pub streams: usize,
    pub packets: usize,
    pub payload_size: usize,
    pub header_size: usize,
    pub internal_core: i64,
    pub application_cores: Vec<i64>,
    pub sleep_us: u64,
    pub max_path_differential_us: u64,
    pub extended_sequence: bool,
    pub register_memory: bool,
    pub wait_event: bool,
    pub allocator: MemoryKind,
}

impl IpoReceiverArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let gpu_id = matches
            .value_of("gpu-id")
            .map(|s| parse_number::<u32>(s, "gpu id"))
            .transpose()?;
        let args = IpoReceiverArgs {
            local_ips: parse_csv(required(matches, "local-ips")?, "local ip")?,
            src_ips: parse_csv(required(matches, "src-ips")?, "source ip")?,
            dst_ips: parse_csv(required(matches, "dst-ips")?, "destination ip")?,
            dst_ports: parse_csv(required(matches, "dst-ports")?, "destination port")?,
            threads: parse_number(matches.value_of("threads").unwrap_or("1"), "threads")?,
            streams: parse_number(matches.value_of("streams").unwrap_or("1"), "streams")?,
            packets: parse_number(matches.value_of("packets").unwrap_or("262144"), "packets")?,
            payload_size: parse_number(
                matches.value_of("payload-size").unwrap_or("1500"),
                "payload size",
            )?,
            header_size: parse_number(
                matches.value_of("app-hdr-size").unwrap_or("0"),
                "header size",
            )?,
            internal_core: parse_number(
                matches.value_of("internal-core").unwrap_or("-1"),
                "internal core",
            )?,
            application_cores: matches
                .value_of("application-core")
                .map(|s| parse_csv(s, "application core"))
                .transpose()?
                .unwrap_or_else(|| vec![CPU_NONE]),
            sleep_us: parse_number(matches.value_of("sleep-us").unwrap_or("0"), "sleep")?,
            max_path_differential_us: parse_number(
                matches.value_of("max-pd").unwrap_or("50000"),
                "path differential",
            )?,
            extended_sequence: matches.is_present("ext-seq-num"),
            register_memory: matches.is_present("register-memory"),
            wait_event: matches.is_present("wait-event"),
            allocator: parse_allocator(
                matches.value_of("allocator-type").unwrap_or("huge"),
                gpu_id,
            )?,
        };
        args.validate()?;
        Ok(args)
    }

    fn validate(&self) -> Result<()> {
        let paths = self.local_ips.len();
        if paths == 0 {
            return Err(Error::invalid_argument("at least one source IP is needed"));
        }
        if self.src_ips.len() != paths
            || self.dst_ips.len() != paths
            || self.dst_ports.len() != paths
        {
            return Err(Error::invalid_argument(
                "local-ips, src-ips, dst-ips and dst-ports must list one entry per path",
            ));
        }
        if self.max_path_differential_us == 0 || self.max_path_differential_us > 1_000_000 {
            return Err(Error::invalid_argument(
                "path differential must be within one second",
            ));
        }
        if self.register_memory && self.header_size == 0 {
            return Err(Error::invalid_argument(
                "memory registration is supported only in header-data split mode",
            ));
        }
        if self.streams == 0 || self.threads == 0 {
            return Err(Error::invalid_argument("streams and threads must be non-zero"));
        }
        Ok(())
    }
}

/// `riptide-player` — media TX pipeline with generated content.
pub fn player_command() -> Command<'static> {
    Command::new("riptide-player")
        .about("SMPTE ST 2110 media player")
        .arg(
            Arg::new("local-ip")
                .long("local-ip")
                .takes_value(true)
                .default_value("127.0.0.1")
                .help("Local NIC address to send from"),
        )
        .arg(
            Arg::new("dst-ips")
                .long("dst-ips")
                .takes_value(true)
                .required(true)
                .help("Comma separated destinations: video[,audio[,ancillary]]"),
        )
        .arg(
            Arg::new("dst-ports")
                .long("dst-ports")
                .takes_value(true)
                .required(true)
                .help("Comma separated ports: video[,audio[,ancillary]]"),
        )
        .arg(
            Arg::new("stream-type")
                .short('p')
                .long("stream-type")
                .takes_value(true)
                .default_value("van")
                .help("Streams to play: v video, a audio, n ancillary"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .takes_value(true)
                .default_value("1920"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .takes_value(true)
                .default_value("1080"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .takes_value(true)
                .default_value("60")
                .help("Exact frame rate: integer, n/d or a conventional decimal"),
        )
        .arg(
            Arg::new("interlaced")
                .long("interlaced")
                .takes_value(false),
        )
        .arg(
            Arg::new("bit-depth")
                .long("bit-depth")
                .takes_value(true)
                .default_value("10")
                .help("Video bit depth: 8 or 10"),
        )
        .arg(
            Arg::new("vid-p-size")
                .short('b')
                .long("vid-p-size")
                .takes_value(true)
                .default_value("1248")
                .help("Packet size ceiling for video"),
        )
        .arg(
            Arg::new("allow-padding")
                .short('a')
                .long("allow-padding")
                .takes_value(false)
                .help("Pad the last packet of a frame/field to uniform size"),
        )
        .arg(
            Arg::new("tro-modification")
                .short('o')
                .long("tro-modification")
                .takes_value(true)
                .default_value("4")
                .help("Reduce the default TRO by this many packet times"),
        )
        .arg(
            Arg::new("loop")
                .short('l')
                .long("loop")
                .takes_value(false)
                .help("Play in a loop"),
        )
        .arg(
            Arg::new("disable-synchronization")
                .long("disable-synchronization")
                .takes_value(false)
                .requires("loop")
                .help("Skip the EOF realignment between loop iterations"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .takes_value(true)
                .default_value("10")
                .help("Content seconds per iteration"),
        )
        .arg(
            Arg::new("thread-cpu-affinity")
                .short('t')
                .long("thread-cpu-affinity")
                .takes_value(true)
                .help("Comma separated cores: converter,video-sender,encoder,audio-sender"),
        )
        .arg(
            Arg::new("internal-core")
                .short('r')
                .long("internal-core")
                .takes_value(true)
                .default_value("-1")
                .help("CPU core of the transport workers"),
        )
        .arg(
            Arg::new("wait")
                .short('w')
                .long("wait")
                .takes_value(false)
                .help("Disable event-driven waiting (sleep instead)"),
        )
        .arg(
            Arg::new("sleep-us")
                .long("sleep-us")
                .takes_value(true)
                .default_value("100"),
        )
        .arg(
            Arg::new("clock")
                .short('v')
                .long("clock")
                .takes_value(true)
                .default_value("system")
                .help("Clock source: system or ptp"),
        )
        .arg(
            Arg::new("ptp-device")
                .long("ptp-device")
                .takes_value(true)
                .help("PTP hardware clock device path"),
        )
        .arg(
            Arg::new("did")
                .long("did")
                .takes_value(true)
                .default_value("96")
                .help("Ancillary DID"),
        )
        .arg(
            Arg::new("sdid")
                .long("sdid")
                .takes_value(true)
                .default_value("96")
                .help("Ancillary SDID"),
        )
}

#[derive(Debug, Clone)]
pub struct PlayerArgs {
    pub local_ip: Ipv4Addr,
    pub dst_ips: Vec<Ipv4Addr>,
    pub dst_ports: Vec<u16>,
    pub video: bool,
    pub audio: bool,
    pub ancillary: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub scan: Scan,
    pub pixel_format: PixelFormat,
    pub mtu: usize,
    pub allow_padding: bool,
    pub tro_modification: u16,
    pub loop_mode: bool,
    pub disable_synchronization: bool,
    pub duration_seconds: u64,
    pub cores: Vec<i64>,
    pub internal_core: i64,
    pub wait_event: bool,
    pub sleep_us: u64,
    pub clock: ClockSource,
    pub did: u16,
    pub sdid: u16,
}

impl PlayerArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let selection = matches.value_of("stream-type").unwrap_or("van");
        if selection.is_empty() || selection.chars().any(|c| !"van".contains(c)) {
            return Err(Error::invalid_argument(format!(
                "invalid stream type {selection:?}; options are v, a, n"
            )));
        }
        let video = selection.contains('v');
        let audio = selection.contains('a');
        let ancillary = selection.contains('n');
        if ancillary && !video {
            return Err(Error::invalid_argument(
                "an ancillary stream should be sent with a video stream only",
            ));
        }

        let pixel_format = match matches.value_of("bit-depth").unwrap_or("10") {
            "8" => PixelFormat::Uyvy422,
            "10" => PixelFormat::Yuv422p10,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported bit depth {other}"
                )))
            }
        };

        let args = PlayerArgs {
            local_ip: parse_ipv4(matches.value_of("local-ip").unwrap_or("127.0.0.1"))?,
            dst_ips: parse_csv(required(matches, "dst-ips")?, "destination ip")?,
            dst_ports: parse_csv(required(matches, "dst-ports")?, "destination port")?,
            video,
            audio,
            ancillary,
            width: parse_number(matches.value_of("width").unwrap_or("1920"), "width")?,
            height: parse_number(matches.value_of("height").unwrap_or("1080"), "height")?,
            frame_rate: parse_frame_rate(matches.value_of("fps").unwrap_or("60"))?,
            scan: if matches.is_present("interlaced") {
                Scan::Interlaced
            } else {
                Scan::Progressive
            },
            pixel_format,
            mtu: parse_number(matches.value_of("vid-p-size").unwrap_or("1248"), "packet size")?,
            allow_padding: matches.is_present("allow-padding"),
            tro_modification: parse_number(
                matches.value_of("tro-modification").unwrap_or("4"),
                "tro modification",
            )?,
            loop_mode: matches.is_present("loop"),
            disable_synchronization: matches.is_present("disable-synchronization"),
            duration_seconds: parse_number(matches.value_of("duration").unwrap_or("10"), "duration")?,
            cores: matches
                .value_of("thread-cpu-affinity")
                .map(|s| parse_csv(s, "core"))
                .transpose()?
                .unwrap_or_default(),
            internal_core: parse_number(
                matches.value_of("internal-core").unwrap_or("-1"),
                "internal core",
            )?,
            wait_event: !matches.is_present("wait"),
            sleep_us: parse_number(matches.value_of("sleep-us").unwrap_or("100"), "sleep")?,
            clock: parse_clock(matches)?,
            did: parse_number(matches.value_of("did").unwrap_or("96"), "DID")?,
            sdid: parse_number(matches.value_of("sdid").unwrap_or("96"), "SDID")?,
        };

        let streams = video as usize + audio as usize + ancillary as usize;
        if args.dst_ips.len() < streams || args.dst_ports.len() < streams {
            return Err(Error::invalid_argument(format!(
                "{streams} streams selected but only {} destinations given",
                args.dst_ips.len().min(args.dst_ports.len())
            )));
        }
        Ok(args)
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| Error::invalid_argument(format!("--{name} is required")))
}

fn parse_number<T: FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse::<T>()
        .map_err(|_| Error::invalid_argument(format!("bad {what} {s:?}")))
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn test_receiver_args() {
        let matches = receiver_command().try_get_matches_from([
            "riptide-receiver",
            "-i",
            "192.168.1.10",
            "-m",
            "239.1.1.1",
            "-s",
            "10.0.0.1",
            "-p",
            "50020",
            "--checksum-header",
            "--allocator-type",
            "malloc",
        ]);
        let args = ReceiverArgs::from_matches(&matches.unwrap()).unwrap();
        assert_eq!(args.port, 50020);
        assert!(args.checksum_header);
        assert_eq!(args.header_size, crate::checksum::CHECKSUM_HEADER_SIZE);
        assert_eq!(args.allocator, MemoryKind::Malloc);
    }

    #[test]
    fn test_receiver_missing_required_is_usage_error() {
        assert!(receiver_command()
            .try_get_matches_from(["riptide-receiver", "-i", "1.2.3.4"])
            .is_err());
    }

    #[test]
    fn test_ipo_args_path_counts_must_agree() {
        let matches = ipo_receiver_command()
            .try_get_matches_from([
                "riptide-ipo-receiver",
                "--local-ips",
                "1.2.3.4,1.2.3.5",
                "--src-ips",
                "6.7.8.9",
                "--dst-ips",
                "239.1.1.1,239.1.1.2",
                "-p",
                "50020,50120",
                "--allocator-type",
                "malloc",
            ])
            .unwrap();
        assert!(IpoReceiverArgs::from_matches(&matches).is_err());
    }

    #[test]
    fn test_ipo_args_two_paths() {
        let matches = ipo_receiver_command()
            .try_get_matches_from([
                "riptide-ipo-receiver",
                "--local-ips",
                "1.2.3.4,1.2.3.5",
                "--src-ips",
                "6.7.8.9,6.7.8.10",
                "--dst-ips",
                "239.1.1.1,239.1.1.2",
                "-p",
                "50020,50120",
                "--max-pd",
                "20000",
                "-X",
                "--allocator-type",
                "malloc",
            ])
            .unwrap();
        let args = IpoReceiverArgs::from_matches(&matches).unwrap();
        assert_eq!(args.local_ips.len(), 2);
        assert_eq!(args.max_path_differential_us, 20_000);
        assert!(args.extended_sequence);
    }

    #[test]
    fn test_player_args_ancillary_requires_video() {
        let matches = player_command()
            .try_get_matches_from([
                "riptide-player",
                "--dst-ips",
                "239.1.1.1",
                "--dst-ports",
                "50020",
                "-p",
                "n",
            ])
            .unwrap();
        assert!(PlayerArgs::from_matches(&matches).is_err());
    }

    #[test]
    fn test_player_args_fractional_rate() {
        let matches = player_command()
            .try_get_matches_from([
                "riptide-player",
                "--dst-ips",
                "239.1.1.1,239.1.1.2,239.1.1.3",
                "--dst-ports",
                "50020,50030,50040",
                "--fps",
                "59.94",
            ])
            .unwrap();
        let args = PlayerArgs::from_matches(&matches).unwrap();
        assert_eq!(
            args.frame_rate,
            Rational::from_ratio(60000, 1001).unwrap()
        );
        assert!(args.video && args.audio && args.ancillary);
    }
}
