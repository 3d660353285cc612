//! fMP4 fragmenter tests.
//!
//! These tests feed synthetic TS packet runs through the fragmenter and
//! check the emitted initialization header and fragments at the box level.

use tsmemseg_mp4::Mp4Fragmenter;
use tsmemseg_ts::pes::write_pes_timestamp;
use tsmemseg_ts::psi::{build_pmt_section, Pmt, STREAM_TYPE_AAC_ADTS, STREAM_TYPE_H264, STREAM_TYPE_ID3_METADATA};

// =============================================================================
// Input builders
// =============================================================================

/// Build one TS packet with exactly `payload` as its payload, stuffing the
/// rest with an adaptation field.
fn ts_packet(pid: u16, unit_start: bool, counter: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 184);
    let mut packet = vec![0u8; 188];
    packet[0] = 0x47;
    packet[1] = ((unit_start as u8) << 6) | ((pid >> 8) as u8 & 0x1F);
    packet[2] = (pid & 0xFF) as u8;
    if payload.len() == 184 {
        packet[3] = 0x10 | (counter & 0x0F);
        packet[4..].copy_from_slice(payload);
    } else {
        packet[3] = 0x30 | (counter & 0x0F);
        let adaptation_length = 183 - payload.len();
        packet[4] = adaptation_length as u8;
        if adaptation_length > 0 {
            packet[5] = 0;
            for byte in &mut packet[6..5 + adaptation_length] {
                *byte = 0xFF;
            }
        }
        packet[5 + adaptation_length..].copy_from_slice(payload);
    }
    packet
}

/// Split a PES packet into TS packets on `pid`.
fn pes_to_ts(pid: u16, pes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, chunk) in pes.chunks(184).enumerate() {
        out.extend_from_slice(&ts_packet(pid, i == 0, i as u8 & 0x0F, chunk));
    }
    out
}

/// Build a PES packet. `bounded` writes the real packet length; video PES
/// use length 0 (unbounded).
fn pes_packet(stream_id: u8, pts: Option<u64>, dts: Option<u64>, payload: &[u8], bounded: bool) -> Vec<u8> {
    let mut header_data = Vec::new();
    let mut flags = 0u8;
    if let Some(pts) = pts {
        let mut ts = [0u8; 5];
        if dts.is_some() {
            flags = 0xC0;
            write_pes_timestamp(&mut ts, 0x30, pts);
        } else {
            flags = 0x80;
            write_pes_timestamp(&mut ts, 0x20, pts);
        }
        header_data.extend_from_slice(&ts);
        if let Some(dts) = dts {
            write_pes_timestamp(&mut ts, 0x10, dts);
            header_data.extend_from_slice(&ts);
        }
    }

    let mut pes = vec![0x00, 0x00, 0x01, stream_id];
    let packet_length = if bounded { 3 + header_data.len() + payload.len() } else { 0 };
    pes.push((packet_length >> 8) as u8);
    pes.push((packet_length & 0xFF) as u8);
    pes.push(0x80);
    pes.push(flags);
    pes.push(header_data.len() as u8);
    pes.extend_from_slice(&header_data);
    pes.extend_from_slice(payload);
    pes
}

/// Minimal bit writer for fabricating parameter sets.
struct BitBuf {
    bits: Vec<bool>,
}

impl BitBuf {
    fn new() -> Self {
        Self { bits: Vec::new() }
    }

    fn bit(&mut self, b: u32) -> &mut Self {
        self.bits.push(b != 0);
        self
    }

    fn bits(&mut self, value: u32, n: u8) -> &mut Self {
        for i in (0..n).rev() {
            self.bits.push((value >> i) & 1 != 0);
        }
        self
    }

    fn ue(&mut self, value: u32) -> &mut Self {
        let v = value + 1;
        let len = 32 - v.leading_zeros() as u8;
        for _ in 0..len - 1 {
            self.bits.push(false);
        }
        self.bits(v, len)
    }

    fn finish(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, &b) in self.bits.iter().enumerate() {
            if b {
                data[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        data
    }
}

/// Baseline-profile AVC SPS, `width_mbs`*16 x 720.
fn avc_sps(width_mbs: u32) -> Vec<u8> {
    let mut b = BitBuf::new();
    b.bits(0x67, 8); // NAL header
    b.bits(66, 8).bits(0, 16); // profile, constraints, level
    b.ue(0); // sps_id
    b.ue(0); // log2_max_frame_num_minus4
    b.ue(2); // pic_order_cnt_type
    b.ue(1); // max_num_ref_frames
    b.bit(0); // gaps_in_frame_num
    b.ue(width_mbs - 1);
    b.ue(44); // 720 / 16 - 1
    b.bit(1); // frame_mbs_only
    b.bit(0); // direct_8x8
    b.bit(0); // cropping
    b.bit(0); // vui
    b.bit(1); // stop bit
    b.finish()
}

const AVC_PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

/// An ES payload with SPS, PPS and one IDR slice.
fn avc_idr_payload(sps: &[u8], slice_bytes: usize) -> Vec<u8> {
    let mut es = vec![0x00, 0x00, 0x01];
    es.extend_from_slice(sps);
    es.extend_from_slice(&[0x00, 0x00, 0x01]);
    es.extend_from_slice(&AVC_PPS);
    es.extend_from_slice(&[0x00, 0x00, 0x01, 0x65]);
    es.extend(std::iter::repeat(0xAB).take(slice_bytes));
    es
}

fn video_pmt() -> Pmt {
    pmt_from(&[(STREAM_TYPE_H264, 0x100)])
}

fn pmt_from(streams: &[(u8, u16)]) -> Pmt {
    let mut pmt = Pmt::default();
    pmt.pmt_pid = 0x1000;
    let mut payload = vec![0u8];
    payload.extend_from_slice(&build_pmt_section(1, 0, 0x100, streams));
    pmt.extract(&payload, true, 0);
    pmt
}

fn adts_frame(payload_len: usize) -> Vec<u8> {
    tsmemseg_codecs::adts::build_adts_frame(1, 4, 2, &vec![0x5A; payload_len])
}

// =============================================================================
// Box inspection helpers
// =============================================================================

fn top_level_boxes(data: &[u8]) -> Vec<([u8; 4], std::ops::Range<usize>)> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let fourcc: [u8; 4] = data[pos + 4..pos + 8].try_into().unwrap();
        assert!(size >= 8, "box size too small at {pos}");
        assert!(pos + size <= data.len(), "box overruns buffer at {pos}");
        boxes.push((fourcc, pos..pos + size));
        pos += size;
    }
    assert_eq!(pos, data.len(), "trailing bytes after last box");
    boxes
}

fn find_boxes<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> Vec<&'a [u8]> {
    top_level_boxes(data)
        .into_iter()
        .filter(|(f, _)| f == fourcc)
        .map(|(_, range)| &data[range])
        .collect()
}

fn count_occurrences(data: &[u8], needle: &[u8]) -> usize {
    data.windows(needle.len()).filter(|w| *w == needle).count()
}

// =============================================================================
// Initialization header
// =============================================================================

#[test]
fn test_header_emitted_after_valid_sps() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    let pes = pes_packet(0xE0, Some(90_000), None, &avc_idr_payload(&avc_sps(80), 64), false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);

    let header = fragmenter.header();
    assert!(!header.is_empty());
    let boxes = top_level_boxes(header);
    assert_eq!(boxes[0].0, *b"ftyp");
    assert_eq!(boxes[1].0, *b"moov");
    assert_eq!(count_occurrences(header, b"trak"), 1);
    assert_eq!(count_occurrences(header, b"avc1"), 2); // ftyp brand + sample entry
    assert_eq!(count_occurrences(header, b"avcC"), 1);
    assert_eq!(count_occurrences(header, b"trex"), 1);
}

#[test]
fn test_header_withheld_until_audio_params() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = pmt_from(&[(STREAM_TYPE_H264, 0x100), (STREAM_TYPE_AAC_ADTS, 0x110)]);

    // Video alone must not produce the header: audio is advertised.
    let pes = pes_packet(0xE0, Some(90_000), None, &avc_idr_payload(&avc_sps(80), 64), false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);
    assert!(fragmenter.header().is_empty());

    // The first audio PES completes the parameter set.
    let audio = pes_packet(0xC0, Some(90_000), None, &adts_frame(32), true);
    fragmenter.add_packets(&pes_to_ts(0x110, &audio), &pmt, false);

    let header = fragmenter.header();
    assert!(!header.is_empty());
    assert_eq!(count_occurrences(header, b"trak"), 2);
    assert_eq!(count_occurrences(header, b"mp4a"), 1);
    assert_eq!(count_occurrences(header, b"esds"), 1);
    assert_eq!(count_occurrences(header, b"trex"), 2);
}

#[test]
fn test_audio_specific_config_bytes() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = pmt_from(&[(STREAM_TYPE_AAC_ADTS, 0x110)]);

    // profile 1 (LC), sampling_frequency_index 4 (44100), 2 channels.
    let audio = pes_packet(0xC0, Some(90_000), None, &adts_frame(32), true);
    fragmenter.add_packets(&pes_to_ts(0x110, &audio), &pmt, false);

    let header = fragmenter.header();
    assert!(!header.is_empty());
    // AudioSpecificConfig: ((1+1)<<3)|(4>>1) = 0x12, ((4&1)<<7)|(2<<3) = 0x10.
    let asc = [0x05u8, 2, 0x12, 0x10];
    assert_eq!(count_occurrences(header, &asc), 1);
}

// =============================================================================
// Fragments
// =============================================================================

#[test]
fn test_fragment_layout_and_data_offset() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    let pes = pes_packet(0xE0, Some(90_000), None, &avc_idr_payload(&avc_sps(80), 64), false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);

    let fragments = fragmenter.fragments();
    let boxes = top_level_boxes(fragments);
    assert_eq!(boxes.len(), 2);
    assert_eq!(boxes[0].0, *b"moof");
    assert_eq!(boxes[1].0, *b"mdat");
    assert_eq!(fragmenter.fragment_sizes(), &[fragments.len()]);

    // mfhd sequence number is 1.
    let moof = &fragments[boxes[0].1.clone()];
    let mfhd_pos = moof.windows(4).position(|w| w == b"mfhd").unwrap();
    let seq = u32::from_be_bytes(moof[mfhd_pos + 8..mfhd_pos + 12].try_into().unwrap());
    assert_eq!(seq, 1);

    // trun data_offset points at the mdat payload, relative to moof start.
    let trun_pos = moof.windows(4).position(|w| w == b"trun").unwrap();
    let data_offset =
        u32::from_be_bytes(moof[trun_pos + 12..trun_pos + 16].try_into().unwrap()) as usize;
    assert_eq!(data_offset, moof.len() + 8);

    // The sample size equals the mdat payload size (one sample).
    let sample_count = u32::from_be_bytes(moof[trun_pos + 8..trun_pos + 12].try_into().unwrap());
    assert_eq!(sample_count, 1);
    let sample_size =
        u32::from_be_bytes(moof[trun_pos + 20..trun_pos + 24].try_into().unwrap()) as usize;
    let mdat = &fragments[boxes[1].1.clone()];
    assert_eq!(sample_size, mdat.len() - 8);

    // Key-frame sample flags.
    let flags = u32::from_be_bytes(moof[trun_pos + 24..trun_pos + 28].try_into().unwrap());
    assert_eq!(flags, 0x0240_0000);
}

#[test]
fn test_aud_and_sei_dropped() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    let mut es = vec![0x00, 0x00, 0x01, 0x09, 0xF0]; // AUD
    es.extend_from_slice(&[0x00, 0x00, 0x01, 0x06, 0x05, 0x01, 0xFF]); // SEI
    es.extend_from_slice(&avc_idr_payload(&avc_sps(80), 32));
    let pes = pes_packet(0xE0, Some(90_000), None, &es, false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);

    let fragments = fragmenter.fragments();
    let boxes = top_level_boxes(fragments);
    let mdat = &fragments[boxes[1].1.clone()];
    // Only the IDR NAL remains: 4-byte length prefix + 1 + 32 bytes.
    assert_eq!(mdat.len() - 8, 4 + 33);
}

#[test]
fn test_mfhd_sequence_monotonic_across_flushes() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    for pts in [90_000u64, 180_000] {
        let pes = pes_packet(0xE0, Some(pts), None, &avc_idr_payload(&avc_sps(80), 16), false);
        fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);
    }

    let fragments = fragmenter.fragments();
    let mut sequences = Vec::new();
    let mut pos = 0;
    while let Some(found) = fragments[pos..].windows(4).position(|w| w == b"mfhd") {
        let at = pos + found;
        sequences.push(u32::from_be_bytes(fragments[at + 8..at + 12].try_into().unwrap()));
        pos = at + 4;
    }
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(fragmenter.fragment_sizes().len(), 2);
}

#[test]
fn test_sample_durations_inherit_forward() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    // Three samples in one flush, 3000-tick cadence. The first sample has
    // no DTS delta of its own and inherits from the next.
    let mut ts = Vec::new();
    for i in 0..3u64 {
        let payload = if i == 0 {
            avc_idr_payload(&avc_sps(80), 16)
        } else {
            let mut es = vec![0x00, 0x00, 0x01, 0x41, 0x9A];
            es.extend(std::iter::repeat(0x11).take(16));
            es
        };
        let pes = pes_packet(0xE0, Some(90_000 + i * 3000), None, &payload, false);
        ts.extend_from_slice(&pes_to_ts(0x100, &pes));
    }
    fragmenter.add_packets(&ts, &pmt, false);

    // 3 samples x 3000 ticks = 100 ms.
    assert_eq!(fragmenter.fragment_durations_msec(), &[100]);

    let fragments = fragmenter.fragments();
    let trun_pos = fragments.windows(4).position(|w| w == b"trun").unwrap();
    let sample_count =
        u32::from_be_bytes(fragments[trun_pos + 8..trun_pos + 12].try_into().unwrap());
    assert_eq!(sample_count, 3);
    for i in 0..3 {
        let entry = trun_pos + 16 + i * 16;
        let duration =
            u32::from_be_bytes(fragments[entry..entry + 4].try_into().unwrap());
        assert_eq!(duration, 3000);
    }
}

#[test]
fn test_parameter_change_drops_fragment() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    let pes = pes_packet(0xE0, Some(90_000), None, &avc_idr_payload(&avc_sps(80), 16), false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);
    assert_eq!(fragmenter.fragment_sizes().len(), 1);
    fragmenter.clear_fragments();

    // A different SPS after moov: the flush's samples are discarded.
    let pes = pes_packet(0xE0, Some(180_000), None, &avc_idr_payload(&avc_sps(120), 16), false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes), &pmt, false);
    assert!(fragmenter.fragment_sizes().is_empty());
    assert!(fragmenter.fragments().is_empty());
}

#[test]
fn test_forced_flush_keeps_trailing_pes_buffered() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = video_pmt();

    let pes = pes_packet(0xE0, Some(90_000), None, &avc_idr_payload(&avc_sps(80), 16), false);
    let ts = pes_to_ts(0x100, &pes);

    // Forced segmentation: the buffer may cut mid-PES, so nothing flushes.
    fragmenter.add_packets(&ts, &pmt, true);
    assert!(fragmenter.fragment_sizes().is_empty());

    // The next flush starts with a unit-start, completing the held PES.
    let pes2 = pes_packet(0xE0, Some(93_000), None, &avc_idr_payload(&avc_sps(80), 16), false);
    fragmenter.add_packets(&pes_to_ts(0x100, &pes2), &pmt, false);
    assert_eq!(fragmenter.fragment_sizes().len(), 1);

    let fragments = fragmenter.fragments();
    let trun_pos = fragments.windows(4).position(|w| w == b"trun").unwrap();
    let sample_count =
        u32::from_be_bytes(fragments[trun_pos + 8..trun_pos + 12].try_into().unwrap());
    assert_eq!(sample_count, 2);
}

// =============================================================================
// ID3 bridging
// =============================================================================

#[test]
fn test_id3_pes_becomes_emsg() {
    let mut fragmenter = Mp4Fragmenter::new();
    let pmt = pmt_from(&[(STREAM_TYPE_H264, 0x100), (STREAM_TYPE_ID3_METADATA, 0x120)]);

    let id3_payload = b"ID3\x04\x00\x00\x00\x00\x00\x0atest-frame";
    let mut ts = pes_to_ts(0x120, &pes_packet(0xBD, Some(91_000), None, id3_payload, true));
    let video = pes_packet(0xE0, Some(90_000), None, &avc_idr_payload(&avc_sps(80), 16), false);
    ts.extend_from_slice(&pes_to_ts(0x100, &video));
    fragmenter.add_packets(&ts, &pmt, false);

    let fragments = fragmenter.fragments();
    let boxes = top_level_boxes(fragments);
    assert_eq!(boxes[0].0, *b"emsg");
    assert_eq!(boxes[1].0, *b"moof");
    assert_eq!(boxes[2].0, *b"mdat");

    let emsg = &fragments[boxes[0].1.clone()];
    // version 1, flags 0.
    assert_eq!(&emsg[8..12], &[1, 0, 0, 0]);
    // timescale 90000.
    assert_eq!(u32::from_be_bytes(emsg[12..16].try_into().unwrap()), 90_000);
    assert_eq!(count_occurrences(emsg, b"https://aomedia.org/emsg/ID3"), 1);
    assert_eq!(count_occurrences(emsg, id3_payload), 1);
    // event_duration / id follow the 8-byte presentation time.
    assert_eq!(u32::from_be_bytes(emsg[24..28].try_into().unwrap()), 0xFFFF_FFFF);
    assert_eq!(u32::from_be_bytes(emsg[28..32].try_into().unwrap()), 0);
}
