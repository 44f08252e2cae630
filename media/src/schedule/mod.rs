#[cfg(test)]
mod schedule_test;

use rtp::params::Scan;
use util::clock::{time_to_rtp_timestamp, Clock};
use util::{Error, Rational, Result};

/// Commits whose window opens sooner than this are issued immediately
/// (timeout 0) instead of being scheduled.
pub const COMMIT_GUARD_NS: u64 = 600;

/// Lead time of the pre-loop sleep before the first scheduled send.
pub const START_SLEEP_LEAD_NS: u64 = 1_000_000_000;

/// Loop-mode realign margin added on top of the latest stream.
pub const LOOP_REALIGN_MARGIN_NS: u64 = 100_000_000;

/// Inputs of the transmission-offset computation for a video stream.
#[derive(Debug, Clone, Copy)]
pub struct TroParams {
    pub scan: Scan,
    pub height: u32,
    /// Nominal packets per full frame (both fields when interlaced).
    pub packets_per_frame: u32,
    /// Number of packet times subtracted from the default offset.
    pub tro_modification: u16,
}

fn tro_table(scan: Scan, height: u32) -> Result<(Rational, Rational)> {
    let ratio = |n, d| Rational::from_ratio(n, d);
    match scan {
        Scan::Progressive => {
            let r_active = ratio(1080, 1125)?;
            let multiplier = if height >= 1080 {
                ratio(43, 1125)?
            } else {
                ratio(28, 750)?
            };
            Ok((r_active, multiplier))
        }
        Scan::Interlaced => {
            if height >= 1080 {
                Ok((ratio(1080, 1125)?, ratio(22, 1125)?))
            } else if height >= 576 {
                Ok((ratio(576, 625)?, ratio(26, 625)?))
            } else {
                Ok((ratio(487, 525)?, ratio(20, 525)?))
            }
        }
    }
}

/// Default transmission offset of the first packet relative to the
/// frame-aligned epoch: `multiplier * T_frame - M * Trs`, with
/// `Trs = T_frame * R_active / packets_per_frame`.
pub fn tro_offset(t_frame: &Rational, params: &TroParams) -> Result<Rational> {
    if params.packets_per_frame == 0 {
        return Err(Error::invalid_argument("zero packets per frame"));
    }
    let (r_active, multiplier) = tro_table(params.scan, params.height)?;
    let trs = (*t_frame * r_active) / params.packets_per_frame as u64;
    let default_tro = multiplier * *t_frame;
    default_tro.checked_sub(&(trs * params.tro_modification as u64))
}

/// First-packet send time: the next frame-rate-aligned point after
/// `now_ns`, shifted by the TRO when scheduling video.
pub fn first_packet_time(
    now_ns: u64,
    frame_rate: &Rational,
    tro: Option<&TroParams>,
) -> Result<Rational> {
    if frame_rate.is_zero() {
        return Err(Error::invalid_argument("zero frame rate"));
    }
    let t_frame = Rational::from_integer(1_000_000_000).checked_div(frame_rate)?;
    let n = Rational::from_integer(now_ns).checked_div(&t_frame)?.floor() + 1;
    let mut t0 = t_frame * n;
    if let Some(params) = tro {
        t0 = t0 + tro_offset(&t_frame, params)?;
    }
    Ok(t0)
}

/// Per-stream send-time progression, exact to the rational frame rate:
/// `T(k) = start + k * interval`, recomputed from the start point so no
/// floating error accumulates.
#[derive(Debug, Clone)]
pub struct TxSchedule {
    clock: Clock,
    interval: Rational,
    start: Rational,
    next: Rational,
    sent_frames_fields: u64,
}

impl TxSchedule {
    /// `interval` is the frame interval, halved by the caller for
    /// interlaced fields.
    pub fn new(clock: Clock, first_send: Rational, interval: Rational) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::invalid_argument("zero send interval"));
        }
        Ok(TxSchedule {
            clock,
            interval,
            start: first_send,
            next: first_send,
            sent_frames_fields: 0,
        })
    }

    pub fn next_send_ns(&self) -> u64 {
        self.next.floor()
    }

    pub fn interval(&self) -> &Rational {
        &self.interval
    }

    /// RTP tick of the next scheduled send.
    pub fn timestamp_tick(&self, sample_rate: u32) -> u64 {
        time_to_rtp_timestamp(self.next_send_ns(), sample_rate)
    }

    /// Advances to the next frame/field boundary.
    pub fn advance_frame_field(&mut self) {
        self.sent_frames_fields += 1;
        self.next = self.start + self.interval * self.sent_frames_fields;
    }

    /// Restarts the progression from a realigned point (loop mode).
    pub fn realign(&mut self, start_ns: u64) {
        self.start = Rational::from_integer(start_ns);
        self.next = self.start;
        self.sent_frames_fields = 0;
    }

    /// Commit timeout for a chunk: the scheduled send time on the first
    /// chunk of a frame/field, zero mid-frame. A window closer than the
    /// guard is issued immediately; otherwise the time is converted into
    /// the transport clock domain.
    pub fn commit_timeout(&self, first_chunk_of_frame_field: bool) -> u64 {
        if !first_chunk_of_frame_field {
            return 0;
        }
        let timeout = self.next_send_ns();
        if timeout + COMMIT_GUARD_NS < self.clock.now_ns() {
            0
        } else {
            self.clock.align_to_transport_clock(timeout)
        }
    }

    /// Pre-loop sleep: parks the sender until shortly before its first
    /// send.
    pub fn sleep_until_start(&self) {
        self.clock.go_to_sleep(self.next_send_ns(), START_SLEEP_LEAD_NS);
    }
}
