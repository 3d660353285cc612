//! TS-to-fMP4 fragmenter.
//!
//! [`Mp4Fragmenter::add_packets`] is called once per segment/fragment flush
//! with the TS packets of that flush. It reassembles PES per elementary
//! stream, latches codec parameters, and appends one fragment's worth of
//! boxes to an internal output buffer the caller drains per flush.
//!
//! The initialization header (`ftyp` + `moov`) is produced exactly once,
//! when every stream advertised by the PMT has yielded valid parameters.
//! A parameter-set change after that point drops the in-flight fragment's
//! samples; there is no mid-stream `moov` rewrite.

use tsmemseg_codecs::adts::{sync_adts_payload, AdtsHeader};
use tsmemseg_codecs::avc::{slice_is_intra, AvcSps};
use tsmemseg_codecs::hevc::{HevcPps, HevcSps, HevcVps};
use tsmemseg_codecs::nal::for_each_nal;
use tsmemseg_core::timestamp::{wrap33_diff, MAX_CLOCK_LEAP, TIMESTAMP_MAX};
use tsmemseg_ts::packet;
use tsmemseg_ts::pes::{is_audio_stream_id, is_video_stream_id, read_pes_timestamp, STREAM_ID_PRIVATE_1};
use tsmemseg_ts::psi::Pmt;

use crate::boxes::{patch_u32, push_box, push_full_box, push_u16, push_u32, push_u64};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// Fallback video sample duration when no forward DTS delta is known
/// (3000 ticks, about 33 ms at 90 kHz).
const DEFAULT_SAMPLE_DURATION: u32 = 3000;

/// Upper bound for wrapped deltas taken as forward (matches
/// [`MAX_CLOCK_LEAP`], 10 s at 90 kHz).
fn capped_forward(diff: u64) -> u64 {
    if diff < (1u64 << 32) {
        diff.min(MAX_CLOCK_LEAP)
    } else {
        0
    }
}

/// Per-track PES reassembly buffer.
#[derive(Default)]
struct PesBuffer {
    counter: u8,
    data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TrackKind {
    Video,
    Audio,
    Id3,
}

/// Video codec parameters latched from the first complete SPS.
enum SpsParams {
    Avc(AvcSps),
    Hevc(HevcSps),
}

impl SpsParams {
    fn codec_width(&self) -> u32 {
        match self {
            SpsParams::Avc(s) => s.codec_width,
            SpsParams::Hevc(s) => s.codec_width,
        }
    }

    fn codec_height(&self) -> u32 {
        match self {
            SpsParams::Avc(s) => s.codec_height,
            SpsParams::Hevc(s) => s.codec_height,
        }
    }

    fn sar(&self) -> (u32, u32) {
        match self {
            SpsParams::Avc(s) => (s.sar_width, s.sar_height),
            SpsParams::Hevc(s) => (s.sar_width, s.sar_height),
        }
    }

    fn chroma_format_idc(&self) -> u8 {
        match self {
            SpsParams::Avc(s) => s.chroma_format_idc,
            SpsParams::Hevc(s) => s.chroma_format_idc,
        }
    }

    fn bit_depths_minus8(&self) -> (u8, u8) {
        match self {
            SpsParams::Avc(s) => (s.bit_depth_luma_minus8, s.bit_depth_chroma_minus8),
            SpsParams::Hevc(s) => (s.bit_depth_luma_minus8, s.bit_depth_chroma_minus8),
        }
    }
}

/// Audio parameters latched from ADTS headers.
#[derive(Clone, Copy, PartialEq, Eq)]
struct AudioParams {
    profile: u8,
    sampling_frequency_index: u8,
    sampling_frequency: u32,
    channel_configuration: u8,
}

struct VideoSampleInfo {
    sample_size: u32,
    is_key: bool,
    /// Forward DTS delta from the previous sample; `None` when unknown.
    sample_duration: Option<u32>,
    composition_time_offset: u32,
}

/// Converts per-flush TS packet runs into fMP4 fragments.
pub struct Mp4Fragmenter {
    fragment_count: u32,
    fragment_duration_residual: i64,
    fragments: Vec<u8>,
    fragment_sizes: Vec<usize>,
    fragment_durations_msec: Vec<u32>,

    video_pes: PesBuffer,
    audio_pes: PesBuffer,
    id3_pes: PesBuffer,

    video_pts: Option<u64>,
    video_dts: Option<u64>,
    video_decode_time: u64,
    video_decode_time_dts: Option<u64>,

    audio_pts: Option<u64>,
    audio_decode_time: u64,
    audio_decode_time_pts: Option<u64>,

    adts_workspace: Vec<u8>,
    emsg: Vec<u8>,
    video_mdat: Vec<u8>,
    audio_mdat: Vec<u8>,
    moov: Vec<u8>,

    h265: bool,
    video_params: Option<SpsParams>,
    parallelism_type: u8,
    num_temporal_layers: u8,
    temporal_id_nesting_flag: bool,
    vps: Vec<u8>,
    sps: Vec<u8>,
    pps: Vec<u8>,
    video_samples: Vec<VideoSampleInfo>,

    audio_params: Option<AudioParams>,
    audio_sample_sizes: Vec<u16>,
}

impl Default for Mp4Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Mp4Fragmenter {
    /// Create an empty fragmenter.
    pub fn new() -> Self {
        Self {
            fragment_count: 0,
            fragment_duration_residual: 0,
            fragments: Vec::new(),
            fragment_sizes: Vec::new(),
            fragment_durations_msec: Vec::new(),
            video_pes: PesBuffer::default(),
            audio_pes: PesBuffer::default(),
            id3_pes: PesBuffer::default(),
            video_pts: None,
            video_dts: None,
            video_decode_time: 0,
            video_decode_time_dts: None,
            audio_pts: None,
            audio_decode_time: 0,
            audio_decode_time_pts: None,
            adts_workspace: Vec::new(),
            emsg: Vec::new(),
            video_mdat: Vec::new(),
            audio_mdat: Vec::new(),
            moov: Vec::new(),
            h265: false,
            video_params: None,
            parallelism_type: 0,
            num_temporal_layers: 1,
            temporal_id_nesting_flag: false,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            video_samples: Vec::new(),
            audio_params: None,
            audio_sample_sizes: Vec::new(),
        }
    }

    /// The initialization header (`ftyp` + `moov`), empty until every
    /// advertised stream has produced valid parameters.
    pub fn header(&self) -> &[u8] {
        &self.moov
    }

    /// Fragment bytes accumulated since the last [`clear_fragments`](Self::clear_fragments).
    pub fn fragments(&self) -> &[u8] {
        &self.fragments
    }

    /// Byte size of each accumulated fragment.
    pub fn fragment_sizes(&self) -> &[usize] {
        &self.fragment_sizes
    }

    /// Duration in milliseconds of each accumulated fragment.
    pub fn fragment_durations_msec(&self) -> &[u32] {
        &self.fragment_durations_msec
    }

    /// Drop the accumulated fragments (after the caller published them).
    pub fn clear_fragments(&mut self) {
        self.fragments.clear();
        self.fragment_sizes.clear();
        self.fragment_durations_msec.clear();
    }

    /// Consume the TS packets of one flush and append at most one fragment.
    ///
    /// `packets_may_not_end_at_unit_start` is set for forced segmentation,
    /// where the accumulation buffer was cut mid-PES; the trailing
    /// unbounded video PES is then kept buffered instead of being flushed.
    pub fn add_packets(&mut self, packets: &[u8], pmt: &Pmt, packets_may_not_end_at_unit_start: bool) {
        let mut base_video_dts: Option<u64> = None;
        let mut base_audio_pts: Option<u64> = None;
        self.emsg.clear();
        self.video_mdat.clear();
        self.audio_mdat.clear();
        self.video_samples.clear();
        self.audio_sample_sizes.clear();

        let h265 = pmt.is_h265();
        for chunk in packets.chunks_exact(packet::PACKET_SIZE) {
            let unit_start = packet::is_unit_start(chunk);
            let pid = packet::pid(chunk);
            let counter = packet::continuity_counter(chunk);
            let payload = packet::payload(chunk);

            if pid == 0 {
                continue;
            }
            let kind = if pid == pmt.first_video_pid {
                TrackKind::Video
            } else if pid == pmt.first_adts_audio_pid {
                TrackKind::Audio
            } else if pid == pmt.first_id3_metadata_pid {
                TrackKind::Id3
            } else {
                continue;
            };

            if unit_start {
                self.pes_mut(kind).counter = counter;
                if kind == TrackKind::Video && is_unbounded_pes(&self.video_pes.data) {
                    // The previous unbounded video PES is complete.
                    let pes = std::mem::take(&mut self.video_pes.data);
                    self.add_video_pes(&pes, h265);
                    if base_video_dts.is_none() {
                        base_video_dts = self.video_dts;
                    }
                }
                let pes = self.pes_mut(kind);
                pes.data.clear();
                pes.data.extend_from_slice(payload);
            } else if !self.pes_mut(kind).data.is_empty() {
                let pes = self.pes_mut(kind);
                pes.counter = (pes.counter + 1) & 0x0F;
                if pes.counter == counter {
                    pes.data.extend_from_slice(payload);
                } else {
                    // Ignore packets until the next unit-start.
                    pes.data.clear();
                }
            }

            let data = &self.pes_mut(kind).data;
            if data.len() >= 6 {
                let pes_packet_length = ((data[4] as usize) << 8) | data[5] as usize;
                if pes_packet_length != 0 && data.len() >= 6 + pes_packet_length {
                    let mut pes = std::mem::take(&mut self.pes_mut(kind).data);
                    pes.truncate(6 + pes_packet_length);
                    if pes.starts_with(&[0, 0, 1]) {
                        match kind {
                            TrackKind::Video => {
                                self.add_video_pes(&pes, h265);
                                if base_video_dts.is_none() {
                                    base_video_dts = self.video_dts;
                                }
                            }
                            TrackKind::Audio => {
                                self.add_audio_pes(&pes);
                                if base_audio_pts.is_none() {
                                    base_audio_pts = self.audio_pts;
                                }
                            }
                            TrackKind::Id3 => self.add_id3_pes(&pes),
                        }
                    }
                }
            }
        }

        if is_unbounded_pes(&self.video_pes.data) && !packets_may_not_end_at_unit_start {
            // The flush is split at a unit start, so the buffered video PES
            // is complete even without seeing the next one.
            let pes = std::mem::take(&mut self.video_pes.data);
            self.add_video_pes(&pes, h265);
            if base_video_dts.is_none() {
                base_video_dts = self.video_dts;
            }
        }

        if self.moov.is_empty()
            && (pmt.first_video_pid == 0 || self.video_params.is_some())
            && (pmt.first_adts_audio_pid == 0 || self.audio_params.is_some())
        {
            let mut moov = Vec::new();
            push_box(&mut moov, b"ftyp", |data| {
                data.extend_from_slice(b"isom");
                push_u32(data, 1);
                data.extend_from_slice(b"isom");
                data.extend_from_slice(b"avc1");
            });
            self.push_moov(&mut moov);
            self.moov = moov;
        }

        if !self.moov.is_empty() {
            let start = self.fragments.len();
            let mut fragment_duration_msec = 0u32;
            let emsg = std::mem::take(&mut self.emsg);
            self.fragments.extend_from_slice(&emsg);
            if !self.video_samples.is_empty() || !self.audio_sample_sizes.is_empty() {
                self.advance_decode_times(base_video_dts, base_audio_pts);

                let mut fragments = std::mem::take(&mut self.fragments);
                let (ticks, timescale) = self.push_moof(&mut fragments);
                self.fragments = fragments;
                if ticks > 0 {
                    let num = ticks * 1000 + self.fragment_duration_residual;
                    fragment_duration_msec = (num / timescale) as u32;
                    self.fragment_duration_residual = num % timescale;
                }
            }
            let size = self.fragments.len() - start;
            if size > 0 {
                self.fragment_sizes.push(size);
                self.fragment_durations_msec.push(fragment_duration_msec);
            }
        }
    }

    fn pes_mut(&mut self, kind: TrackKind) -> &mut PesBuffer {
        match kind {
            TrackKind::Video => &mut self.video_pes,
            TrackKind::Audio => &mut self.audio_pes,
            TrackKind::Id3 => &mut self.id3_pes,
        }
    }

    /// Advance the decode clocks to this flush's base timestamps, seeding a
    /// clock that has never run from the other one (leap capped at 10 s).
    fn advance_decode_times(&mut self, base_video_dts: Option<u64>, base_audio_pts: Option<u64>) {
        if let (Some(base), Some(anchor)) = (base_video_dts, self.video_decode_time_dts) {
            let diff = wrap33_diff(base, anchor);
            if diff < (1u64 << 32) {
                self.video_decode_time += diff;
            }
            self.video_decode_time_dts = Some(base);
        }
        if let (Some(base), Some(anchor)) = (base_audio_pts, self.audio_decode_time_pts) {
            let diff = wrap33_diff(base, anchor);
            if diff < (1u64 << 32) {
                self.audio_decode_time += diff;
            }
            self.audio_decode_time_pts = Some(base);
        }

        if self.video_decode_time_dts.is_none() {
            if let Some(base) = base_video_dts {
                if let Some(audio_anchor) = self.audio_decode_time_pts {
                    let diff = self
                        .audio_decode_time
                        .wrapping_add(base)
                        .wrapping_sub(audio_anchor)
                        & TIMESTAMP_MAX;
                    self.video_decode_time = capped_forward(diff);
                } else if let Some(audio_base) = base_audio_pts {
                    self.video_decode_time = capped_forward(wrap33_diff(base, audio_base));
                }
                self.video_decode_time_dts = Some(base);
            }
        }
        if self.audio_decode_time_pts.is_none() {
            if let Some(base) = base_audio_pts {
                if let Some(video_anchor) = self.video_decode_time_dts {
                    let diff = self
                        .video_decode_time
                        .wrapping_add(base)
                        .wrapping_sub(video_anchor)
                        & TIMESTAMP_MAX;
                    self.audio_decode_time = capped_forward(diff);
                }
                self.audio_decode_time_pts = Some(base);
            }
        }
    }

    fn add_video_pes(&mut self, pes: &[u8], h265: bool) {
        let stream_id = pes[3];
        if !is_video_stream_id(stream_id) || pes.len() < 9 {
            return;
        }
        let payload_pos = 9 + pes[8] as usize;
        if payload_pos >= pes.len() {
            return;
        }

        let last_dts = self.video_dts;
        let pts_dts_flags = pes[7] >> 6;
        if pts_dts_flags >= 2 && pes.len() >= 14 {
            self.video_pts = Some(read_pes_timestamp(&pes[9..14]));
            self.video_dts = self.video_pts;
            if pts_dts_flags == 3 && pes.len() >= 19 {
                self.video_dts = Some(read_pes_timestamp(&pes[14..19]));
            }
        }

        let (sps_type, pps_type, aud_type) = if h265 { (33, 34, 35) } else { (7, 8, 9) };
        let mut parameter_changed = false;
        let mut is_key = false;
        let mut sample_size = 0usize;
        for_each_nal(&pes[payload_pos..], |nal| {
            if nal.is_empty() {
                return;
            }
            let nal_unit_type = if h265 { (nal[0] >> 1) & 0x3F } else { nal[0] & 0x1F };
            let is_sei = if h265 {
                nal_unit_type == 39 || nal_unit_type == 40
            } else {
                nal_unit_type == 6
            };
            if h265 && nal_unit_type == 32 {
                if self.vps != nal {
                    if self.moov.is_empty() {
                        self.vps = nal.to_vec();
                        if let Ok(vps) = HevcVps::parse(nal) {
                            self.num_temporal_layers = vps.num_temporal_layers;
                            self.temporal_id_nesting_flag = vps.temporal_id_nesting_flag;
                        }
                    } else {
                        parameter_changed = true;
                    }
                }
            } else if nal_unit_type == sps_type {
                if self.sps != nal {
                    if self.moov.is_empty() {
                        self.sps = nal.to_vec();
                        self.video_params = if h265 {
                            match HevcSps::parse(nal) {
                                Ok(sps) => {
                                    self.temporal_id_nesting_flag = sps.temporal_id_nesting_flag;
                                    Some(SpsParams::Hevc(sps))
                                }
                                Err(_) => None,
                            }
                        } else {
                            AvcSps::parse(nal).ok().map(SpsParams::Avc)
                        };
                    } else {
                        parameter_changed = true;
                    }
                }
            } else if nal_unit_type == pps_type {
                if self.pps != nal {
                    if self.moov.is_empty() {
                        self.pps = nal.to_vec();
                        if h265 {
                            if let Ok(pps) = HevcPps::parse(nal) {
                                self.parallelism_type = pps.parallelism_type;
                            }
                        }
                    } else {
                        parameter_changed = true;
                    }
                }
            } else if nal_unit_type == aud_type || is_sei {
                // AUD and SEI are not carried into samples.
            } else {
                let is_irap = if h265 {
                    (16..=21).contains(&nal_unit_type)
                } else {
                    nal_unit_type == 5
                };
                if is_irap {
                    is_key = true;
                } else if !h265 && nal_unit_type == 1 && slice_is_intra(nal) {
                    // Non-IDR I/SI picture.
                    is_key = true;
                }
                sample_size += 4 + nal.len();
                push_u32(&mut self.video_mdat, nal.len() as u32);
                self.video_mdat.extend_from_slice(nal);
            }
        });

        if self.moov.is_empty() {
            self.h265 = h265;
        } else if self.h265 != h265 {
            parameter_changed = true;
        }

        if self.video_params.is_none() || parameter_changed {
            self.video_mdat.clear();
            self.video_samples.clear();
        } else {
            let sample_duration = match (last_dts, self.video_dts) {
                (Some(last), Some(current)) => {
                    let diff = wrap33_diff(current, last);
                    if diff > MAX_CLOCK_LEAP {
                        None
                    } else {
                        Some(diff as u32)
                    }
                }
                _ => None,
            };
            let composition_time_offset = match (self.video_pts, self.video_dts) {
                (Some(pts), Some(dts)) => {
                    let diff = wrap33_diff(pts, dts);
                    if diff > MAX_CLOCK_LEAP {
                        0
                    } else {
                        diff as u32
                    }
                }
                _ => 0,
            };
            self.video_samples.push(VideoSampleInfo {
                sample_size: sample_size as u32,
                is_key,
                sample_duration,
                composition_time_offset,
            });
        }
    }

    fn add_audio_pes(&mut self, pes: &[u8]) {
        let stream_id = pes[3];
        if !is_audio_stream_id(stream_id) || pes.len() < 9 {
            return;
        }
        let payload_pos = 9 + pes[8] as usize;
        if payload_pos >= pes.len() {
            return;
        }
        let mut workspace = std::mem::take(&mut self.adts_workspace);
        if !sync_adts_payload(&mut workspace, &pes[payload_pos..]) {
            self.adts_workspace = workspace;
            return;
        }

        let pts_dts_flags = pes[7] >> 6;
        if pts_dts_flags >= 2 && pes.len() >= 14 {
            self.audio_pts = Some(read_pes_timestamp(&pes[9..14]));
        }

        loop {
            if workspace.is_empty() {
                break;
            }
            if workspace[0] != 0xFF {
                // Need to resync.
                workspace.clear();
                break;
            }
            if workspace.len() < 7 {
                break;
            }
            let Some(header) = AdtsHeader::parse(&workspace) else {
                workspace.clear();
                break;
            };
            if workspace.len() < header.frame_length {
                break;
            }

            if self.moov.is_empty() {
                if let Some(sampling_frequency) = header.sampling_frequency() {
                    self.audio_params = Some(AudioParams {
                        profile: header.profile,
                        sampling_frequency_index: header.sampling_frequency_index,
                        sampling_frequency,
                        channel_configuration: header.channel_configuration,
                    });
                }
            }
            let matches = self.audio_params.is_some_and(|p| {
                p.profile == header.profile
                    && p.sampling_frequency_index == header.sampling_frequency_index
                    && p.channel_configuration == header.channel_configuration
            });
            if matches {
                self.audio_mdat
                    .extend_from_slice(&workspace[header.header_size..header.frame_length]);
                self.audio_sample_sizes
                    .push((header.frame_length - header.header_size) as u16);
            }
            workspace.drain(..header.frame_length);
        }

        if !workspace.is_empty() {
            // Mark the head byte as a synchronized 0xFF.
            workspace[0] = 0;
        }
        self.adts_workspace = workspace;
    }

    fn add_id3_pes(&mut self, pes: &[u8]) {
        let stream_id = pes[3];
        if stream_id != STREAM_ID_PRIVATE_1 || pes.len() < 14 {
            return;
        }
        let payload_pos = 9 + pes[8] as usize;
        let pts_dts_flags = pes[7] >> 6;
        if payload_pos >= pes.len() || pts_dts_flags < 2 {
            return;
        }

        // Sync with media time.
        let (mut emsg_time, media_time_anchor) = if self.video_decode_time_dts.is_some() {
            (self.video_decode_time, self.video_decode_time_dts)
        } else {
            (self.audio_decode_time, self.audio_decode_time_pts)
        };
        if let Some(anchor) = media_time_anchor {
            let pts = read_pes_timestamp(&pes[9..14]);
            emsg_time += capped_forward(wrap33_diff(pts, anchor));
        }

        let mut emsg = std::mem::take(&mut self.emsg);
        push_full_box(&mut emsg, b"emsg", 0x0100_0000, |data| {
            push_u32(data, 90_000);
            push_u64(data, emsg_time);
            push_u32(data, 0xFFFF_FFFF);
            push_u32(data, 0);
            data.extend_from_slice(b"https://aomedia.org/emsg/ID3");
            data.push(0);
            data.push(0);
            data.extend_from_slice(&pes[payload_pos..]);
        });
        self.emsg = emsg;
    }

    fn push_moov(&self, data: &mut Vec<u8>) {
        push_box(data, b"moov", |data| {
            push_full_box(data, b"mvhd", 0x0000_0000, |data| {
                push_u32(data, 0); // creation_time
                push_u32(data, 0); // modification_time
                push_u32(data, 1000); // timescale
                push_u32(data, 0); // duration
                push_u32(data, 0x0001_0000); // rate
                push_u16(data, 0x0100); // volume
                push_u16(data, 0);
                push_u32(data, 0);
                push_u32(data, 0);
                push_unity_matrix(data);
                for _ in 0..6 {
                    push_u32(data, 0); // pre_defined
                }
                push_u32(data, AUDIO_TRACK_ID + 1); // next_track_ID
            });

            if let Some(params) = &self.video_params {
                self.push_video_trak(data, params);
            }
            if let Some(params) = &self.audio_params {
                self.push_audio_trak(data, params);
            }

            push_box(data, b"mvex", |data| {
                if self.video_params.is_some() {
                    push_full_box(data, b"trex", 0x0000_0000, |data| {
                        push_u32(data, VIDEO_TRACK_ID);
                        push_u32(data, 1); // default_sample_description_index
                        push_u32(data, 0);
                        push_u32(data, 0);
                        push_u32(data, 0);
                    });
                }
                if self.audio_params.is_some() {
                    push_full_box(data, b"trex", 0x0000_0000, |data| {
                        push_u32(data, AUDIO_TRACK_ID);
                        push_u32(data, 1);
                        push_u32(data, 0);
                        push_u32(data, 0);
                        push_u32(data, 0);
                    });
                }
            });
        });
    }

    fn push_video_trak(&self, data: &mut Vec<u8>, params: &SpsParams) {
        let (sar_width, sar_height) = params.sar();
        push_box(data, b"trak", |data| {
            push_full_box(data, b"tkhd", 0x0000_0003, |data| {
                push_u32(data, 0); // creation_time
                push_u32(data, 0); // modification_time
                push_u32(data, VIDEO_TRACK_ID);
                push_u32(data, 0); // reserved
                push_u32(data, 0); // duration
                push_u32(data, 0);
                push_u32(data, 0);
                push_u16(data, 0); // layer
                push_u16(data, 0); // alternate_group
                push_u16(data, 0); // volume
                push_u16(data, 0);
                push_unity_matrix(data);
                // Display width scaled by the sample aspect ratio, 16.16.
                let display_width =
                    (params.codec_width() * sar_width + (sar_height - 1)) / sar_height;
                push_u16(data, display_width as u16);
                push_u16(data, 0);
                push_u16(data, params.codec_height() as u16);
                push_u16(data, 0);
            });
            push_box(data, b"mdia", |data| {
                push_full_box(data, b"mdhd", 0x0000_0000, |data| {
                    push_u32(data, 0);
                    push_u32(data, 0);
                    push_u32(data, 90_000); // timescale
                    push_u32(data, 0);
                    push_u16(data, 0x55C4); // language "und"
                    push_u16(data, 0);
                });
                push_full_box(data, b"hdlr", 0x0000_0000, |data| {
                    push_u32(data, 0);
                    data.extend_from_slice(b"vide");
                    push_u32(data, 0);
                    push_u32(data, 0);
                    push_u32(data, 0);
                    data.extend_from_slice(b"Video Handler");
                    data.push(0);
                });
                push_box(data, b"minf", |data| {
                    push_full_box(data, b"vmhd", 0x0000_0001, |data| {
                        push_u16(data, 0);
                        push_u16(data, 0);
                        push_u16(data, 0);
                        push_u16(data, 0);
                    });
                    push_dinf(data);
                    push_box(data, b"stbl", |data| {
                        push_full_box(data, b"stsd", 0x0000_0000, |data| {
                            push_u32(data, 1);
                            let fourcc = if self.h265 { b"hvc1" } else { b"avc1" };
                            push_box(data, fourcc, |data| {
                                data.extend_from_slice(&[0u8; 6]);
                                push_u16(data, 1); // data_reference_index
                                push_u16(data, 0);
                                push_u16(data, 0);
                                push_u32(data, 0);
                                push_u32(data, 0);
                                push_u32(data, 0);
                                push_u16(data, params.codec_width() as u16);
                                push_u16(data, params.codec_height() as u16);
                                push_u16(data, 72); // horizresolution
                                push_u16(data, 0);
                                push_u16(data, 72); // vertresolution
                                push_u16(data, 0);
                                push_u32(data, 0);
                                push_u16(data, 1); // frame_count
                                data.extend_from_slice(&[0u8; 32]); // compressorname
                                push_u16(data, 24); // depth
                                push_u16(data, 0xFFFF); // pre_defined
                                if let SpsParams::Hevc(sps) = params {
                                    self.push_hvcc(data, sps);
                                } else {
                                    self.push_avcc(data, params);
                                }
                            });
                        });
                        push_empty_sample_tables(data);
                    });
                });
            });
        });
    }

    fn push_avcc(&self, data: &mut Vec<u8>, params: &SpsParams) {
        push_box(data, b"avcC", |data| {
            data.push(1); // configurationVersion
            data.push(self.sps[1]); // AVCProfileIndication
            data.push(self.sps[2]); // profile_compatibility
            data.push(self.sps[3]); // AVCLevelIndication
            data.push(0xFF); // lengthSizeMinusOne = 3
            data.push(0xE1); // numOfSequenceParameterSets = 1
            push_u16(data, self.sps.len() as u16);
            data.extend_from_slice(&self.sps);
            data.push(1); // numOfPictureParameterSets
            push_u16(data, self.pps.len() as u16);
            data.extend_from_slice(&self.pps);
            if self.sps[3] != 66 && self.sps[3] != 77 && self.sps[3] != 88 {
                let (luma, chroma) = params.bit_depths_minus8();
                data.push(0xFC | params.chroma_format_idc());
                data.push(0xF8 | luma);
                data.push(0xF8 | chroma);
                data.push(0); // numOfSequenceParameterSetExt
            }
        });
    }

    fn push_hvcc(&self, data: &mut Vec<u8>, sps: &HevcSps) {
        push_box(data, b"hvcC", |data| {
            data.push(1); // configurationVersion
            data.push(
                (sps.general_profile_space << 6)
                    | ((sps.general_tier_flag as u8) << 5)
                    | sps.general_profile_idc,
            );
            data.extend_from_slice(&sps.general_profile_compatibility_flags);
            data.extend_from_slice(&sps.general_constraint_indicator_flags);
            data.push(sps.general_level_idc);
            push_u16(data, 0xF000 | sps.min_spatial_segmentation_idc);
            data.push(0xFC | self.parallelism_type);
            data.push(0xFC | sps.chroma_format_idc);
            data.push(0xF8 | sps.bit_depth_luma_minus8);
            data.push(0xF8 | sps.bit_depth_chroma_minus8);
            push_u16(data, 0); // avgFrameRate
            data.push(
                ((self.num_temporal_layers & 0x07) << 3)
                    | ((self.temporal_id_nesting_flag as u8) << 2)
                    | 3, // lengthSizeMinusOne
            );
            data.push(3); // numOfArrays
            for (nal_type, bytes) in [(32u8, &self.vps), (33, &self.sps), (34, &self.pps)] {
                data.push(0x80 | nal_type); // array_completeness set
                push_u16(data, 1); // numNalus
                push_u16(data, bytes.len() as u16);
                data.extend_from_slice(bytes);
            }
        });
    }

    fn push_audio_trak(&self, data: &mut Vec<u8>, params: &AudioParams) {
        push_box(data, b"trak", |data| {
            push_full_box(data, b"tkhd", 0x0000_0003, |data| {
                push_u32(data, 0);
                push_u32(data, 0);
                push_u32(data, AUDIO_TRACK_ID);
                push_u32(data, 0);
                push_u32(data, 0);
                push_u32(data, 0);
                push_u32(data, 0);
                push_u16(data, 0); // layer
                push_u16(data, 1); // alternate_group
                push_u16(data, 0x0100); // volume
                push_u16(data, 0);
                push_unity_matrix(data);
                push_u32(data, 0); // width
                push_u32(data, 0); // height
            });
            push_box(data, b"mdia", |data| {
                push_full_box(data, b"mdhd", 0x0000_0000, |data| {
                    push_u32(data, 0);
                    push_u32(data, 0);
                    push_u32(data, params.sampling_frequency);
                    push_u32(data, 0);
                    push_u16(data, 0x55C4); // language "und"
                    push_u16(data, 0);
                });
                push_full_box(data, b"hdlr", 0x0000_0000, |data| {
                    push_u32(data, 0);
                    data.extend_from_slice(b"soun");
                    push_u32(data, 0);
                    push_u32(data, 0);
                    push_u32(data, 0);
                    data.extend_from_slice(b"Audio Handler");
                    data.push(0);
                });
                push_box(data, b"minf", |data| {
                    push_full_box(data, b"smhd", 0x0000_0000, |data| {
                        push_u16(data, 0); // balance
                        push_u16(data, 0);
                    });
                    push_dinf(data);
                    push_box(data, b"stbl", |data| {
                        push_full_box(data, b"stsd", 0x0000_0000, |data| {
                            push_u32(data, 1);
                            push_box(data, b"mp4a", |data| {
                                data.extend_from_slice(&[0u8; 6]);
                                push_u16(data, 1); // data_reference_index
                                push_u32(data, 0);
                                push_u32(data, 0);
                                push_u16(data, params.channel_configuration as u16);
                                push_u16(data, 16); // samplesize
                                push_u32(data, 0);
                                push_u16(data, params.sampling_frequency as u16);
                                push_u16(data, 0);
                                push_full_box(data, b"esds", 0x0000_0000, |data| {
                                    // ES_Descriptor
                                    data.push(0x03);
                                    data.push(25);
                                    push_u16(data, 1); // ES_ID
                                    data.push(0);
                                    // DecoderConfigDescriptor
                                    data.push(0x04);
                                    data.push(17);
                                    data.push(0x40); // objectTypeIndication: AAC
                                    data.push(0x15); // streamType: audio
                                    data.push(0);
                                    data.push(0);
                                    data.push(0);
                                    push_u32(data, 0); // maxBitrate
                                    push_u32(data, 0); // avgBitrate
                                    // DecoderSpecificInfo (AudioSpecificConfig)
                                    data.push(0x05);
                                    data.push(2);
                                    data.push(
                                        ((params.profile + 1) << 3)
                                            | (params.sampling_frequency_index >> 1),
                                    );
                                    data.push(
                                        ((params.sampling_frequency_index & 0x01) << 7)
                                            | (params.channel_configuration << 3),
                                    );
                                    // SLConfigDescriptor
                                    data.push(0x06);
                                    data.push(1);
                                    data.push(2); // MP4
                                });
                            });
                        });
                        push_empty_sample_tables(data);
                    });
                });
            });
        });
    }

    /// Append the fragment's `moof`+`mdat` pairs; returns the fragment
    /// duration as (ticks, timescale).
    fn push_moof(&mut self, data: &mut Vec<u8>) -> (i64, i64) {
        let mut duration: (i64, i64) = (0, 1);

        if !self.video_samples.is_empty() {
            let moof_begin = data.len();
            let mut offset_field_pos = 0usize;
            self.fragment_count += 1;
            let fragment_count = self.fragment_count;
            push_box(data, b"moof", |data| {
                push_full_box(data, b"mfhd", 0x0000_0000, |data| {
                    push_u32(data, fragment_count);
                });
                push_box(data, b"traf", |data| {
                    push_full_box(data, b"tfhd", 0x0000_0000, |data| {
                        push_u32(data, VIDEO_TRACK_ID);
                    });
                    push_full_box(data, b"tfdt", 0x0100_0000, |data| {
                        push_u64(data, self.video_decode_time);
                    });
                    push_full_box(data, b"trun", 0x0000_0F01, |data| {
                        push_u32(data, self.video_samples.len() as u32);
                        offset_field_pos = data.len();
                        push_u32(data, 0); // data_offset, patched below
                        for (index, sample) in self.video_samples.iter().enumerate() {
                            let sample_duration = self.video_samples[index..]
                                .iter()
                                .find_map(|s| s.sample_duration)
                                .unwrap_or(DEFAULT_SAMPLE_DURATION);
                            duration.0 += sample_duration as i64;
                            duration.1 = 90_000;
                            push_u32(data, sample_duration);
                            push_u32(data, sample.sample_size);
                            push_u32(data, if sample.is_key { 0x0240_0000 } else { 0x0101_0000 });
                            push_u32(data, sample.composition_time_offset);
                        }
                    });
                });
            });
            push_box(data, b"mdat", |data| {
                let mdat_payload_offset = (data.len() - moof_begin) as u32;
                patch_u32(data, offset_field_pos, mdat_payload_offset);
                data.extend_from_slice(&self.video_mdat);
            });
        }

        if !self.audio_sample_sizes.is_empty() {
            let moof_begin = data.len();
            let mut offset_field_pos = 0usize;
            self.fragment_count += 1;
            let fragment_count = self.fragment_count;
            let sampling_frequency = self
                .audio_params
                .map(|p| p.sampling_frequency as u64)
                .unwrap_or(90_000);
            push_box(data, b"moof", |data| {
                push_full_box(data, b"mfhd", 0x0000_0000, |data| {
                    push_u32(data, fragment_count);
                });
                push_box(data, b"traf", |data| {
                    push_full_box(data, b"tfhd", 0x0000_0028, |data| {
                        push_u32(data, AUDIO_TRACK_ID);
                        push_u32(data, 1024); // default_sample_duration
                        push_u32(data, 0x0200_0000); // default_sample_flags
                    });
                    push_full_box(data, b"tfdt", 0x0100_0000, |data| {
                        push_u64(data, self.audio_decode_time * sampling_frequency / 90_000);
                    });
                    push_full_box(data, b"trun", 0x0000_0201, |data| {
                        push_u32(data, self.audio_sample_sizes.len() as u32);
                        offset_field_pos = data.len();
                        push_u32(data, 0); // data_offset, patched below
                        for &size in &self.audio_sample_sizes {
                            push_u32(data, size as u32);
                        }
                        if self.video_params.is_none() {
                            duration.0 = 1024 * self.audio_sample_sizes.len() as i64;
                            duration.1 = sampling_frequency as i64;
                        }
                    });
                });
            });
            push_box(data, b"mdat", |data| {
                let mdat_payload_offset = (data.len() - moof_begin) as u32;
                patch_u32(data, offset_field_pos, mdat_payload_offset);
                data.extend_from_slice(&self.audio_mdat);
            });
        }

        duration
    }
}

/// A buffered PES with a valid start code and packet_length 0.
fn is_unbounded_pes(data: &[u8]) -> bool {
    data.len() >= 6 && data.starts_with(&[0, 0, 1]) && data[4] == 0 && data[5] == 0
}

fn push_unity_matrix(data: &mut Vec<u8>) {
    push_u32(data, 0x0001_0000);
    push_u32(data, 0);
    push_u32(data, 0);
    push_u32(data, 0);
    push_u32(data, 0x0001_0000);
    push_u32(data, 0);
    push_u32(data, 0);
    push_u32(data, 0);
    push_u32(data, 0x4000_0000);
}

fn push_dinf(data: &mut Vec<u8>) {
    push_box(data, b"dinf", |data| {
        push_full_box(data, b"dref", 0x0000_0000, |data| {
            push_u32(data, 1);
            push_full_box(data, b"url ", 0x0000_0001, |_| {});
        });
    });
}

fn push_empty_sample_tables(data: &mut Vec<u8>) {
    push_full_box(data, b"stts", 0x0000_0000, |data| {
        push_u32(data, 0);
    });
    push_full_box(data, b"stsc", 0x0000_0000, |data| {
        push_u32(data, 0);
    });
    push_full_box(data, b"stsz", 0x0000_0000, |data| {
        push_u32(data, 0);
        push_u32(data, 0);
    });
    push_full_box(data, b"stco", 0x0000_0000, |data| {
        push_u32(data, 0);
    });
}
