use super::*;
use crate::header::peek_sequence_number;
use crate::params::{AudioFormat, PixelFormat, Resolution, Scan, VideoFormat};
use util::marshal::Unmarshal;
use util::Rational;

fn format_1080p10(mtu: usize) -> VideoFormat {
    VideoFormat {
        resolution: Resolution::new(1920, 1080),
        scan: Scan::Progressive,
        pixel_format: PixelFormat::Yuv422p10,
        frame_rate: Rational::from_integer(60),
        payload_type: 96,
        mtu,
        allow_padding: false,
    }
}

fn frame_for(format: &VideoFormat) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let Resolution { width, height } = format.resolution;
    let pixels = (width * height) as usize;
    match format.pixel_format {
        PixelFormat::Yuv422p8 => (
            (0..pixels).map(|i| i as u8).collect(),
            (0..pixels / 2).map(|i| (i * 3) as u8).collect(),
            (0..pixels / 2).map(|i| (i * 7) as u8).collect(),
        ),
        PixelFormat::Yuv422p10 => (
            (0..pixels * 2).map(|i| (i % 251) as u8).collect(),
            (0..pixels).map(|i| (i % 239) as u8).collect(),
            (0..pixels).map(|i| (i % 233) as u8).collect(),
        ),
        PixelFormat::Uyvy422 => ((0..pixels * 2).map(|i| (i % 241) as u8).collect(), vec![], vec![]),
    }
}

fn fill_frame_field(framer: &mut VideoFramer, frame: &FrameRef<'_>) -> Vec<Vec<u8>> {
    let mut cursor = framer.begin_frame_field();
    let mut packets = Vec::new();
    while !cursor.done() {
        let planned = framer.plan().sizes()[cursor.packet_counter] as usize;
        let mut buf = vec![0u8; planned];
        let written = framer.fill_packet(&mut buf, &mut cursor, frame).unwrap();
        assert_eq!(written, planned);
        packets.push(buf);
    }
    framer.end_frame_field();
    packets
}

fn payload_group_checks(packet: &[u8], group_size: usize) -> usize {
    // walk the SRDs and verify every one covers whole pixel groups
    let srd1 = SrdHeader::parse(&packet[HEADER_SIZE + EXTENSION_SEQ_SIZE..]).unwrap();
    assert_eq!(srd1.length as usize % group_size, 0, "first SRD length");
    let mut payload_bytes = srd1.length as usize;
    let mut header_bytes = USER_HEADER_SIZE;
    if srd1.continuation {
        let srd2 =
            SrdHeader::parse(&packet[HEADER_SIZE + EXTENSION_SEQ_SIZE + SRD_HEADER_SIZE..]).unwrap();
        assert!(!srd2.continuation, "at most two SRDs");
        assert_eq!(srd2.length as usize % group_size, 0, "second SRD length");
        assert_eq!(srd2.offset, 0, "second SRD starts its line");
        payload_bytes += srd2.length as usize;
        header_bytes += SRD_HEADER_SIZE;
    }
    assert!(packet.len() >= header_bytes + payload_bytes);
    payload_bytes
}

#[test]
fn test_1080p_10bit_packet_plan() {
    // 1920x1080 4:2:2 10-bit at the standard 1248-byte video packet size:
    // four uniform packets per line, 4320 per frame
    let plan = VideoPacketPlan::new(&format_1080p10(1248)).unwrap();
    assert_eq!(plan.packets_per_frame_field(), 4320);
    assert!(plan.sizes().iter().all(|&s| s == 1220));
}

#[test]
fn test_2160p_10bit_packet_plan() {
    let mut format = format_1080p10(1248);
    format.resolution = Resolution::new(3840, 2160);
    let plan = VideoPacketPlan::new(&format).unwrap();
    assert_eq!(plan.packets_per_frame_field(), 17280);
}

#[test]
fn test_packets_per_frame_table() {
    assert_eq!(
        packets_per_frame_table(Resolution::new(1920, 1080), PixelFormat::Yuv422p10),
        4320
    );
    assert_eq!(
        packets_per_frame_table(Resolution::new(3840, 2160), PixelFormat::Yuv422p10),
        17280
    );
    assert_eq!(
        packets_per_frame_table(Resolution::new(1920, 1080), PixelFormat::Uyvy422),
        3240
    );
    assert_eq!(
        packets_per_frame_table(Resolution::new(3840, 2160), PixelFormat::Yuv422p8),
        12960
    );
}

#[test]
fn test_marker_only_on_last_packet() {
    let format = format_1080p10(1248);
    let mut framer = VideoFramer::new(format.clone(), 0x0eb51dbd).unwrap();
    framer.set_timestamp_tick(1000);
    let (y, cb, cr) = frame_for(&format);
    let frame = FrameRef {
        y: &y,
        cb: &cb,
        cr: &cr,
    };
    let packets = fill_frame_field(&mut framer, &frame);
    assert_eq!(packets.len(), 4320);
    for (i, packet) in packets.iter().enumerate() {
        let mut raw: &[u8] = packet;
        let header = RtpHeader::unmarshal(&mut raw).unwrap();
        assert_eq!(header.marker, i == packets.len() - 1, "packet {i}");
        assert_eq!(header.timestamp, 1000, "same tick across the frame");
        payload_group_checks(packet, 5);
    }
}

#[test]
fn test_sequence_numbers_are_contiguous_with_extension() {
    let format = format_1080p10(1248);
    let mut framer = VideoFramer::new(format.clone(), 1).unwrap();
    let (y, cb, cr) = frame_for(&format);
    let frame = FrameRef {
        y: &y,
        cb: &cb,
        cr: &cr,
    };
    let packets = fill_frame_field(&mut framer, &frame);
    for (i, packet) in packets.iter().enumerate() {
        let low = peek_sequence_number(packet).unwrap() as u32;
        let high =
            u16::from_be_bytes([packet[HEADER_SIZE], packet[HEADER_SIZE + 1]]) as u32;
        assert_eq!(high << 16 | low, i as u32);
    }
    // a second frame keeps counting where the first stopped
    let packets = fill_frame_field(&mut framer, &frame);
    let low = peek_sequence_number(&packets[0]).unwrap() as u32;
    assert_eq!(low, 4320);
}

#[test]
fn test_two_srd_packets_split_lines() {
    // 8-bit 1500-byte packets do not divide a 1920-wide line evenly, so
    // line breaks ride in two-SRD packets
    let format = VideoFormat {
        resolution: Resolution::new(1920, 1080),
        scan: Scan::Progressive,
        pixel_format: PixelFormat::Yuv422p8,
        frame_rate: Rational::from_integer(50),
        payload_type: 96,
        mtu: 1500,
        allow_padding: false,
    };
    let mut framer = VideoFramer::new(format.clone(), 1).unwrap();
    let (y, cb, cr) = frame_for(&format);
    let frame = FrameRef {
        y: &y,
        cb: &cb,
        cr: &cr,
    };
    let packets = fill_frame_field(&mut framer, &frame);
    let mut rows_seen = 0u32;
    let mut two_srd = 0u32;
    let mut last_row = 0u16;
    for packet in &packets {
        let srd1 = SrdHeader::parse(&packet[HEADER_SIZE + EXTENSION_SEQ_SIZE..]).unwrap();
        payload_group_checks(packet, 4);
        if srd1.continuation {
            two_srd += 1;
            let srd2 = SrdHeader::parse(
                &packet[HEADER_SIZE + EXTENSION_SEQ_SIZE + SRD_HEADER_SIZE..],
            )
            .unwrap();
            assert_eq!(
                srd2.row_number,
                (srd1.row_number + 1) % 1080,
                "second SRD is the next line"
            );
        }
        if srd1.row_number != last_row {
            rows_seen += 1;
            last_row = srd1.row_number;
        }
    }
    assert!(two_srd > 0, "expected some two-SRD packets");
    assert!(rows_seen > 1000, "the plan must walk all lines");
    // all pixel groups of the field were consumed
    let total: usize = packets.iter().map(|p| payload_group_checks(p, 4)).sum();
    assert_eq!(total, 960 * 1080 * 4);
}

#[test]
fn test_interlaced_fields_alternate() {
    let format = VideoFormat {
        resolution: Resolution::new(1920, 1080),
        scan: Scan::Interlaced,
        pixel_format: PixelFormat::Yuv422p10,
        frame_rate: Rational::from_integer(60),
        payload_type: 96,
        mtu: 1248,
        allow_padding: false,
    };
    let mut framer = VideoFramer::new(format.clone(), 1).unwrap();
    framer.set_timestamp_tick(0);
    let (y, cb, cr) = frame_for(&format);
    let frame = FrameRef {
        y: &y,
        cb: &cb,
        cr: &cr,
    };

    let first = fill_frame_field(&mut framer, &frame);
    let second = fill_frame_field(&mut framer, &frame);
    // half the progressive packet count per field
    assert_eq!(first.len(), 2160);
    assert_eq!(second.len(), 2160);

    let field_bit = |packets: &[Vec<u8>]| {
        let srd = SrdHeader::parse(&packets[0][HEADER_SIZE + EXTENSION_SEQ_SIZE..]).unwrap();
        srd.field
    };
    assert!(!field_bit(&first));
    assert!(field_bit(&second));

    // marker terminates each field, and the timestamp steps by
    // 90000/(2*fps) between fields
    let mut raw: &[u8] = &first[first.len() - 1];
    let header = RtpHeader::unmarshal(&mut raw).unwrap();
    assert!(header.marker);
    let mut raw: &[u8] = &second[0];
    let header2 = RtpHeader::unmarshal(&mut raw).unwrap();
    assert_eq!(header2.timestamp, 750);
}

#[test]
fn test_padding_keeps_sizes_uniform() {
    // a geometry whose tail packet is short: 1280x720 8-bit
    let mut format = VideoFormat {
        resolution: Resolution::new(1280, 720),
        scan: Scan::Progressive,
        pixel_format: PixelFormat::Yuv422p8,
        frame_rate: Rational::from_integer(50),
        payload_type: 96,
        mtu: 1500,
        allow_padding: false,
    };
    let bare = VideoPacketPlan::new(&format).unwrap();
    format.allow_padding = true;
    let padded = VideoPacketPlan::new(&format).unwrap();
    assert_eq!(bare.packets_per_frame_field(), padded.packets_per_frame_field());
    let last = *padded.sizes().last().unwrap();
    let previous = padded.sizes()[padded.sizes().len() - 2];
    if bare.sizes().last() != padded.sizes().last() {
        assert_eq!(last, previous, "padded tail matches its predecessor");
    }
}

#[test]
fn test_uyvy_payload_is_verbatim_source() {
    let format = VideoFormat {
        resolution: Resolution::new(64, 4),
        scan: Scan::Progressive,
        pixel_format: PixelFormat::Uyvy422,
        frame_rate: Rational::from_integer(50),
        payload_type: 96,
        mtu: 1500,
        allow_padding: false,
    };
    let mut framer = VideoFramer::new(format.clone(), 1).unwrap();
    let (y, _, _) = frame_for(&format);
    let frame = FrameRef {
        y: &y,
        cb: &[],
        cr: &[],
    };
    let packets = fill_frame_field(&mut framer, &frame);
    let mut reassembled = Vec::new();
    for packet in &packets {
        let srd1 = SrdHeader::parse(&packet[HEADER_SIZE + EXTENSION_SEQ_SIZE..]).unwrap();
        let offset = if srd1.continuation {
            USER_HEADER_SIZE + SRD_HEADER_SIZE
        } else {
            USER_HEADER_SIZE
        };
        let len = payload_group_checks(packet, 4);
        reassembled.extend_from_slice(&packet[offset..offset + len]);
    }
    assert_eq!(reassembled, y);
}

#[test]
fn test_10bit_packing_bit_layout() {
    // one pixel group with known samples: cb=0x3FF, y0=0, cr=0x155, y1=0x2AA
    let format = VideoFormat {
        resolution: Resolution::new(2, 1),
        scan: Scan::Progressive,
        pixel_format: PixelFormat::Yuv422p10,
        frame_rate: Rational::from_integer(50),
        payload_type: 96,
        mtu: 1500,
        allow_padding: false,
    };
    let mut framer = VideoFramer::new(format, 1).unwrap();
    let y: Vec<u8> = [0u16, 0x2AA]
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    let cb: Vec<u8> = 0x3FFu16.to_le_bytes().to_vec();
    let cr: Vec<u8> = 0x155u16.to_le_bytes().to_vec();
    let frame = FrameRef {
        y: &y,
        cb: &cb,
        cr: &cr,
    };
    let packets = fill_frame_field(&mut framer, &frame);
    assert_eq!(packets.len(), 1);
    let payload = &packets[0][USER_HEADER_SIZE..USER_HEADER_SIZE + 5];
    // cb(10) y0(10) cr(10) y1(10) packed big-endian-ish per the wire rules
    assert_eq!(payload, &[0xFF, 0xC0, 0x05, 0x56, 0xAA]);
}

#[test]
fn test_mtu_too_small_rejected() {
    let format = format_1080p10(40);
    assert!(VideoPacketPlan::new(&format).is_err());
}

#[test]
fn test_audio_format_smoke() {
    // keeps the cross-module constants honest: 48k/1ms/2ch/24-bit is the
    // canonical AES67 case used by the audio framer tests as well
    let fmt = AudioFormat {
        sample_rate: 48_000,
        channels: 2,
        bit_depth: 24,
        ptime_us: 1_000,
        payload_type: 97,
    };
    assert_eq!(fmt.payload_size(), 288);
}
