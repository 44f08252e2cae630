use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::rational::Rational;

/// TAI is currently ahead of UTC by 37 seconds.
pub const DEFAULT_LEAP_SECONDS: u64 = 37;

/// User-supplied time callback returning nanoseconds.
pub type TimeHandler = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Selectable wall-clock source for send scheduling.
pub enum ClockSource {
    /// System clock shifted forward by the leap-second offset (TAI
    /// approximation). Timestamps handed to the transport are converted
    /// back to UTC by [`Clock::align_to_transport_clock`].
    SystemTai { leap_seconds: u64 },
    /// Opaque library-provided clock; no conversion is applied.
    Handler(TimeHandler),
    /// PTP hardware clock character device of a NIC. Fails `Unsupported`
    /// when the device cannot be opened or read.
    Ptp { device: String },
}

impl Clone for ClockSource {
    fn clone(&self) -> Self {
        match self {
            ClockSource::SystemTai { leap_seconds } => ClockSource::SystemTai {
                leap_seconds: *leap_seconds,
            },
            ClockSource::Handler(handler) => ClockSource::Handler(handler.clone()),
            ClockSource::Ptp { device } => ClockSource::Ptp {
                device: device.clone(),
            },
        }
    }
}

impl fmt::Debug for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockSource::SystemTai { leap_seconds } => {
                write!(f, "SystemTai {{ leap_seconds: {leap_seconds} }}")
            }
            ClockSource::Handler(_) => write!(f, "Handler"),
            ClockSource::Ptp { device } => write!(f, "Ptp {{ device: {device} }}"),
        }
    }
}

/// Shared wall clock. Cheap to clone; every sender, scheduler and
/// transport worker observes the same source so no clock-domain mixing
/// can occur.
#[derive(Clone)]
pub struct Clock {
    handler: TimeHandler,
    /// Subtracted when converting a TAI timestamp to the transport's UTC
    /// domain. Zero for handler and PTP sources.
    tai_offset_ns: u64,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("tai_offset_ns", &self.tai_offset_ns)
            .finish()
    }
}

fn system_time_ns(shift: Duration) -> u64 {
    (SystemTime::now() + shift)
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Clock {
    pub fn new(source: ClockSource) -> Result<Self> {
        match source {
            ClockSource::SystemTai { leap_seconds } => Ok(Clock {
                handler: Arc::new(move || system_time_ns(Duration::from_secs(leap_seconds))),
                tai_offset_ns: leap_seconds * 1_000_000_000,
            }),
            ClockSource::Handler(handler) => Ok(Clock {
                handler,
                tai_offset_ns: 0,
            }),
            ClockSource::Ptp { device } => {
                let handler = ptp_handler(&device)?;
                Ok(Clock {
                    handler,
                    tai_offset_ns: 0,
                })
            }
        }
    }

    pub fn system_tai() -> Self {
        Clock {
            handler: Arc::new(|| system_time_ns(Duration::from_secs(DEFAULT_LEAP_SECONDS))),
            tai_offset_ns: DEFAULT_LEAP_SECONDS * 1_000_000_000,
        }
    }

    pub fn now_ns(&self) -> u64 {
        (self.handler)()
    }

    /// Converts a scheduling timestamp into the transport clock domain.
    pub fn align_to_transport_clock(&self, time_ns: u64) -> u64 {
        time_ns - self.tai_offset_ns
    }

    /// Inverse of [`Clock::align_to_transport_clock`]: lifts a transport
    /// timestamp back into this clock's domain.
    pub fn from_transport_clock(&self, time_ns: u64) -> u64 {
        time_ns + self.tai_offset_ns
    }

    /// Sleeps until `lead_ns` before `wake_ns`, if that point is still in
    /// the future.
    pub fn go_to_sleep(&self, wake_ns: u64, lead_ns: u64) {
        let now = self.now_ns();
        if wake_ns > now + lead_ns {
            std::thread::sleep(Duration::from_nanos(wake_ns - now - lead_ns));
        }
    }
}

#[cfg(target_os = "linux")]
fn ptp_handler(device: &str) -> Result<TimeHandler> {
    use std::ffi::CString;

    let path = CString::new(device)
        .map_err(|_| Error::invalid_argument(format!("bad PTP device path {device:?}")))?;
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(Error::unsupported(format!(
            "PTP clock device {device} is not available"
        )));
    }
    // dynamic posix clock id derived from the char device fd
    let clock_id: libc::clockid_t = ((!(fd as libc::clockid_t)) << 3) | 3;
    let mut probe = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock_id, &mut probe) } != 0 {
        unsafe { libc::close(fd) };
        return Err(Error::unsupported(format!(
            "device {device} does not expose a PTP clock"
        )));
    }
    struct PtpFd(libc::c_int);
    impl Drop for PtpFd {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }
    let holder = Arc::new(PtpFd(fd));
    Ok(Arc::new(move || {
        let _keep_open = &holder;
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
            return 0;
        }
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }))
}

#[cfg(not(target_os = "linux"))]
fn ptp_handler(device: &str) -> Result<TimeHandler> {
    Err(Error::unsupported(format!(
        "PTP clock device {device} is not supported on this platform"
    )))
}

/// Converts a wall-clock time to an RTP timestamp in `sample_rate` ticks.
pub fn time_to_rtp_timestamp(time_ns: u64, sample_rate: u32) -> u64 {
    (time_ns as u128 * sample_rate as u128 / 1_000_000_000u128) as u64
}

/// Frame rates accepted on the wire, keyed by their conventional decimal
/// spelling. Fractional rates map to their exact rational forms.
pub fn lookup_frame_rate(name: &str) -> Option<Rational> {
    let rational = |n, d| Rational::from_ratio(n, d).ok();
    match name {
        "23.976" => rational(24000, 1001),
        "24" => Some(Rational::from_integer(24)),
        "25" => Some(Rational::from_integer(25)),
        "29.97" => rational(30000, 1001),
        "30" => Some(Rational::from_integer(30)),
        "50" => Some(Rational::from_integer(50)),
        "59.94" => rational(60000, 1001),
        "60" => Some(Rational::from_integer(60)),
        _ => None,
    }
}

/// Parses `num/den` or a plain integer or one of the conventional decimal
/// spellings into an exact frame rate.
pub fn parse_frame_rate(s: &str) -> Result<Rational> {
    if let Some((num, den)) = s.split_once('/') {
        let num: u64 = num
            .trim()
            .parse()
            .map_err(|_| Error::invalid_argument(format!("bad frame rate {s:?}")))?;
        let den: u64 = den
            .trim()
            .parse()
            .map_err(|_| Error::invalid_argument(format!("bad frame rate {s:?}")))?;
        return Rational::from_ratio(num, den);
    }
    if let Ok(n) = s.parse::<u64>() {
        return Ok(Rational::from_integer(n));
    }
    lookup_frame_rate(s).ok_or_else(|| Error::invalid_argument(format!("unsupported frame rate {s:?}")))
}

#[cfg(test)]
mod clock_test {
    use super::*;

    #[test]
    fn test_system_tai_is_shifted() {
        let tai = Clock::system_tai();
        let utc = Clock::new(ClockSource::SystemTai { leap_seconds: 0 }).unwrap();
        let t_tai = tai.now_ns();
        let t_utc = utc.now_ns();
        let delta = t_tai - t_utc;
        // 37 s apart, give or take scheduling noise
        assert!(delta > 36_900_000_000 && delta < 37_100_000_000, "delta {delta}");
    }

    #[test]
    fn test_align_to_transport_clock() {
        let clock = Clock::system_tai();
        let t = 1_000_000_000_000u64;
        assert_eq!(
            clock.align_to_transport_clock(t),
            t - DEFAULT_LEAP_SECONDS * 1_000_000_000
        );

        let handler: TimeHandler = Arc::new(|| 42);
        let clock = Clock::new(ClockSource::Handler(handler)).unwrap();
        assert_eq!(clock.now_ns(), 42);
        assert_eq!(clock.align_to_transport_clock(t), t);
    }

    #[test]
    fn test_missing_ptp_device_unsupported() {
        let err = Clock::new(ClockSource::Ptp {
            device: "/dev/ptp-that-does-not-exist".into(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_time_to_rtp_timestamp() {
        assert_eq!(time_to_rtp_timestamp(1_000_000_000, 90000), 90000);
        assert_eq!(time_to_rtp_timestamp(500_000_000, 48000), 24000);
        assert_eq!(time_to_rtp_timestamp(0, 48000), 0);
    }

    #[test]
    fn test_frame_rate_table() {
        assert_eq!(
            lookup_frame_rate("59.94").unwrap(),
            Rational::from_ratio(60000, 1001).unwrap()
        );
        assert_eq!(lookup_frame_rate("60").unwrap(), Rational::from_integer(60));
        assert!(lookup_frame_rate("17").is_none());

        assert_eq!(
            parse_frame_rate("30000/1001").unwrap(),
            Rational::from_ratio(30000, 1001).unwrap()
        );
        assert_eq!(parse_frame_rate("50").unwrap(), Rational::from_integer(50));
        assert!(parse_frame_rate("banana").is_err());
    }
}
