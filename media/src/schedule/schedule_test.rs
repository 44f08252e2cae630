use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::*;
use rtp::params::Scan;
use util::clock::{Clock, ClockSource};

fn manual_clock(now: Arc<AtomicU64>) -> Clock {
    Clock::new(ClockSource::Handler(Arc::new(move || {
        now.load(Ordering::Relaxed)
    })))
    .unwrap()
}

#[test]
fn test_first_packet_time_is_frame_aligned() {
    let fps = Rational::from_integer(50);
    let t0 = first_packet_time(1_000_000_000, &fps, None).unwrap();
    // next 20 ms boundary after 1 s
    assert_eq!(t0, Rational::from_integer(1_020_000_000));

    // exactly on a boundary still moves to the next one
    let t0 = first_packet_time(1_020_000_000, &fps, None).unwrap();
    assert_eq!(t0, Rational::from_integer(1_040_000_000));
}

#[test]
fn test_tro_1080p60() {
    let fps = Rational::from_integer(60);
    let t_frame = Rational::from_integer(1_000_000_000)
        .checked_div(&fps)
        .unwrap();
    let tro = tro_offset(
        &t_frame,
        &TroParams {
            scan: Scan::Progressive,
            height: 1080,
            packets_per_frame: 4320,
            tro_modification: 4,
        },
    )
    .unwrap();
    // (43/1125) * T_frame - 4 * Trs = 637037.037 - 14814.815 ns
    assert_eq!(tro.floor(), 622_222);

    // the offset lands on top of the aligned point
    let t0 = first_packet_time(
        0,
        &fps,
        Some(&TroParams {
            scan: Scan::Progressive,
            height: 1080,
            packets_per_frame: 4320,
            tro_modification: 4,
        }),
    )
    .unwrap();
    let aligned = t_frame * 1u64;
    assert_eq!(t0.checked_sub(&aligned).unwrap(), tro);
}

#[test]
fn test_tro_uses_same_formula_for_uhd() {
    let fps = Rational::from_integer(60);
    let t_frame = Rational::from_integer(1_000_000_000)
        .checked_div(&fps)
        .unwrap();
    let hd = TroParams {
        scan: Scan::Progressive,
        height: 1080,
        packets_per_frame: 17280,
        tro_modification: 4,
    };
    let uhd = TroParams {
        scan: Scan::Progressive,
        height: 2160,
        ..hd
    };
    assert_eq!(
        tro_offset(&t_frame, &hd).unwrap(),
        tro_offset(&t_frame, &uhd).unwrap()
    );
}

#[test]
fn test_tro_interlaced_table() {
    let t_frame = Rational::from_integer(40_000_000); // 25 fps
    let params = |height| TroParams {
        scan: Scan::Interlaced,
        height,
        packets_per_frame: 2000,
        tro_modification: 0,
    };

    let hd = tro_offset(&t_frame, &params(1080)).unwrap();
    assert_eq!(hd, Rational::from_ratio(22, 1125).unwrap() * t_frame);

    let pal = tro_offset(&t_frame, &params(576)).unwrap();
    assert_eq!(pal, Rational::from_ratio(26, 625).unwrap() * t_frame);

    let ntsc = tro_offset(&t_frame, &params(487)).unwrap();
    assert_eq!(ntsc, Rational::from_ratio(20, 525).unwrap() * t_frame);
}

#[test]
fn test_progression_is_exact_over_a_million_frames() {
    let fps = Rational::from_ratio(60000, 1001).unwrap();
    let interval = Rational::from_integer(1_000_000_000)
        .checked_div(&fps)
        .unwrap();
    let start = Rational::from_integer(5_000_000_000);
    let clock = Clock::system_tai();
    let mut schedule = TxSchedule::new(clock, start, interval).unwrap();

    let mut previous = start;
    for k in 1..=1000u64 {
        schedule.advance_frame_field();
        let next = start + interval * k;
        let step = next.checked_sub(&previous).unwrap();
        assert_eq!(step, interval, "frame {k}");
        previous = next;
    }

    // closed-form check out to 10^6 frames: no rounding anywhere
    for _ in 1000..1_000_000u64 {
        schedule.advance_frame_field();
    }
    assert_eq!(
        Rational::from_integer(schedule.next_send_ns()),
        Rational::from_integer((start + interval * 1_000_000u64).floor())
    );
    assert_eq!(
        start + interval * 1_000_000u64,
        start + interval * 1000u64 * 1000u64
    );
}

#[test]
fn test_commit_timeout_guard() {
    let now = Arc::new(AtomicU64::new(1_000_000_000));
    let clock = manual_clock(now.clone());
    let start = Rational::from_integer(1_000_500_000);
    let schedule = TxSchedule::new(clock, start, Rational::from_integer(20_000_000)).unwrap();

    // mid-frame chunks always ship immediately
    assert_eq!(schedule.commit_timeout(false), 0);

    // window comfortably in the future: scheduled (handler clock, no
    // domain conversion)
    assert_eq!(schedule.commit_timeout(true), 1_000_500_000);

    // window more than the guard in the past: immediate
    now.store(1_000_500_000 + COMMIT_GUARD_NS + 1, Ordering::Relaxed);
    assert_eq!(schedule.commit_timeout(true), 0);

    // inside the guard: still scheduled
    now.store(1_000_500_000 + COMMIT_GUARD_NS, Ordering::Relaxed);
    assert_eq!(schedule.commit_timeout(true), 1_000_500_000);
}

#[test]
fn test_realign_restarts_progression() {
    let clock = Clock::system_tai();
    let interval = Rational::from_integer(16_666_666);
    let mut schedule =
        TxSchedule::new(clock, Rational::from_integer(1_000), interval).unwrap();
    schedule.advance_frame_field();
    schedule.advance_frame_field();
    assert_eq!(schedule.next_send_ns(), 1_000 + 2 * 16_666_666);

    schedule.realign(9_000_000_000);
    assert_eq!(schedule.next_send_ns(), 9_000_000_000);
    schedule.advance_frame_field();
    assert_eq!(schedule.next_send_ns(), 9_000_000_000 + 16_666_666);
}

#[test]
fn test_timestamp_tick_matches_sample_rate() {
    let clock = Clock::system_tai();
    let schedule = TxSchedule::new(
        clock,
        Rational::from_integer(2_000_000_000),
        Rational::from_integer(16_666_666),
    )
    .unwrap();
    assert_eq!(schedule.timestamp_tick(90_000), 180_000);
    assert_eq!(schedule.timestamp_tick(48_000), 96_000);
}
