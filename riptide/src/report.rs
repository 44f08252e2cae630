use std::sync::Arc;
use std::time::{Duration, Instant};

use transport::{StatsSnapshot, StreamStats};

/// One named stream being reported on.
pub struct ReportedStream {
    pub name: String,
    pub stats: Arc<StreamStats>,
}

/// Prints one line per stream per second, rate-windowed, mirroring the
/// receive apps' statistics output.
pub struct StatsReporter {
    streams: Vec<ReportedStream>,
    window_start: Instant,
    show_checksum: bool,
}

impl StatsReporter {
    pub fn new(streams: Vec<ReportedStream>, show_checksum: bool) -> Self {
        StatsReporter {
            streams,
            window_start: Instant::now(),
            show_checksum,
        }
    }

    /// Called from the owning loop; emits when a second has elapsed.
    pub fn tick(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return;
        }
        self.window_start = Instant::now();
        for stream in &self.streams {
            let window = stream.stats.take_window();
            println!("{}", format_window(&stream.name, &window, elapsed, self.show_checksum));
        }
    }
}

fn format_window(
    name: &str,
    window: &StatsSnapshot,
    elapsed: Duration,
    show_checksum: bool,
) -> String {
    let seconds = elapsed.as_secs_f64();
    let mbits = window.received_mbits() / seconds.max(1e-9);
    let rate = if mbits > 1000.0 {
        format!("{:.2} Gbps", mbits / 1000.0)
    } else {
        format!("{mbits:.2} Mbps")
    };
    let mut line = format!(
        "[{name}] Got {:7} packets | {rate} during {seconds:.2} sec",
        window.received_packets
    );
    if show_checksum {
        line.push_str(&format!(
            " | {} dropped packets | {} checksum errors",
            window.dropped_packets, window.checksum_mismatch
        ));
    }
    line
}

#[cfg(test)]
mod report_test {
    use super::*;

    #[test]
    fn test_format_window() {
        let window = StatsSnapshot {
            received_packets: 1000,
            received_bytes: 1_250_000,
            dropped_packets: 3,
            checksum_mismatch: 1,
            ..Default::default()
        };
        let line = format_window("rx0", &window, Duration::from_secs(1), true);
        assert!(line.contains("[rx0]"));
        assert!(line.contains("1000 packets"));
        assert!(line.contains("10.00 Mbps"));
        assert!(line.contains("3 dropped"));
        assert!(line.contains("1 checksum"));

        let gig = StatsSnapshot {
            received_bytes: 250_000_000,
            ..Default::default()
        };
        let line = format_window("rx1", &gig, Duration::from_secs(1), false);
        assert!(line.contains("2.00 Gbps"));
        assert!(!line.contains("dropped"));
    }
}
