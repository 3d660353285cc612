//! TS packet accumulation and segment/fragment boundary decisions.
//!
//! The segmenter buffers whole 188-byte packets and cuts the buffer into
//! decoder-startable runs. A cut at a random access point is reordered so
//! that the PAT and PMT lead, complete PES continuations follow, and the
//! packets of PES units straddling the cut carry over into the next run.
//!
//! The key PID is the first video elementary stream; a stream without
//! video keys on the first ADTS audio PID instead, where every PES
//! unit-start counts as a random access point.

use std::collections::HashMap;

use tsmemseg_codecs::nal::{IrapScanner, VideoCodec};
use tsmemseg_core::timestamp::forward_diff;
use tsmemseg_ts::packet;
use tsmemseg_ts::psi::Pat;

/// Hard cap on the accumulation buffer. Exceeding it forces a cut even
/// without a random access point.
const ACCUMULATION_MAX_BYTES: usize = 32 << 20;

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    /// A random access point closed a segment.
    Segment,
    /// A fragment boundary inside the current segment.
    Fragment,
    /// A byte budget was exceeded without a random access point; the run
    /// may not be decoder-startable.
    Forced,
    /// End of input.
    Eof,
}

/// One flushed packet run.
#[derive(Debug)]
pub struct Flush {
    /// What triggered the flush.
    pub kind: FlushKind,
    /// The packet run (multiple of 188 bytes).
    pub packets: Vec<u8>,
    /// Elapsed presentation time covered by the closed segment, in
    /// milliseconds. Zero for fragment flushes.
    pub duration_msec: u32,
}

/// Segmenter tuning, straight from the CLI.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Target duration of the first segment (0 = cut at the first usable
    /// random access point).
    pub target_duration_msec: u32,
    /// Steady-state target segment duration.
    pub next_target_duration_msec: u32,
    /// Target fragment duration inside a segment; 0 disables fragments.
    pub target_frag_duration_msec: u32,
    /// Maximum bytes per segment; 0 disables the budget.
    pub seg_max_bytes: usize,
}

/// Per-PID unit-start positions inside the accumulation buffer.
#[derive(Clone, Copy)]
struct UnitStartRecord {
    /// Most recent unit-start.
    last: usize,
    /// Snapshot of `last` taken at the last key-PID unit-start.
    before_key: usize,
    /// Snapshot taken at the last key-PID unit-start marked for
    /// fragmentation.
    before_marked_key: usize,
}

impl UnitStartRecord {
    fn new(pos: usize) -> Self {
        Self {
            last: pos,
            before_key: usize::MAX,
            before_marked_key: usize::MAX,
        }
    }
}

/// Accumulates TS packets and decides where segments and fragments end.
pub struct Segmenter {
    config: SegmenterConfig,
    pat: Pat,
    key_pid: u16,
    scanner: Option<IrapScanner>,
    unit_starts: HashMap<u16, UnitStartRecord>,
    packets: Vec<u8>,

    pts: u64,
    last_seg_pts: u64,
    pts_initialized: bool,
    is_first_key: bool,

    marked_frag_pts: Option<u64>,
    last_frag_pts: u64,
    audio_arrived: bool,
    fragmentation: bool,

    /// Bytes of the current segment already emitted as fragments.
    emitted_seg_bytes: usize,
    duration_residual_90k: u32,
    forced_segmentations: u64,
}

impl Segmenter {
    /// Create a segmenter. `fragmentation` enables fragment cuts (fMP4
    /// mode with a nonzero fragment target only).
    pub fn new(config: SegmenterConfig, fragmentation: bool) -> Self {
        let fragmentation = fragmentation && config.target_frag_duration_msec > 0;
        Self {
            config,
            pat: Pat::default(),
            key_pid: 0,
            scanner: None,
            unit_starts: HashMap::new(),
            packets: Vec::new(),
            pts: 0,
            last_seg_pts: 0,
            pts_initialized: false,
            is_first_key: true,
            marked_frag_pts: None,
            last_frag_pts: 0,
            audio_arrived: false,
            fragmentation,
            emitted_seg_bytes: 0,
            duration_residual_90k: 0,
            forced_segmentations: 0,
        }
    }

    /// The tracked first-program PAT (PMT reachable through it).
    pub fn pat(&self) -> &Pat {
        &self.pat
    }

    /// How many times a byte budget forced a cut without a key.
    pub fn forced_segmentations(&self) -> u64 {
        self.forced_segmentations
    }

    /// Presentation time accumulated since the last segment cut, in
    /// milliseconds (for read pacing).
    pub fn pending_duration_msec(&self) -> u64 {
        if !self.pts_initialized {
            return 0;
        }
        forward_diff(self.pts, self.last_seg_pts).unwrap_or(0) / 90
    }

    /// Record bytes of the current segment already published as fragments,
    /// so the per-segment byte budget covers them.
    pub fn add_emitted_segment_bytes(&mut self, bytes: usize) {
        self.emitted_seg_bytes += bytes;
    }

    /// Feed one 188-byte packet (sync byte already verified). Returns a
    /// flush when the packet triggered a boundary; the packet itself is
    /// always accumulated into the next run.
    pub fn push_packet(&mut self, chunk: &[u8]) -> Option<Flush> {
        debug_assert_eq!(chunk.len(), packet::PACKET_SIZE);
        let unit_start = packet::is_unit_start(chunk);
        let pid = packet::pid(chunk);
        let counter = packet::continuity_counter(chunk);
        let payload = packet::payload(chunk);

        if unit_start {
            self.unit_starts
                .entry(pid)
                .or_insert_with(|| UnitStartRecord::new(0))
                .last = self.packets.len();
        }

        let pmt_pid = self.pat.first_pmt.pmt_pid;
        let video_pid = self.pat.first_pmt.first_video_pid;
        let audio_pid = self.pat.first_pmt.first_adts_audio_pid;
        let video_codec = VideoCodec::from_stream_type(self.pat.first_pmt.first_video_stream_type);

        if audio_pid != 0 && pid == audio_pid {
            self.audio_arrived = true;
        }

        let mut is_key = false;
        if pid == 0 {
            self.pat.extract(payload, unit_start, counter);
        } else if pmt_pid != 0 && pid == pmt_pid {
            self.pat.first_pmt.extract(payload, unit_start, counter);
        } else if video_pid != 0 && pid == video_pid {
            if let Some(codec) = video_codec {
                if unit_start {
                    self.snapshot_before_key();
                    self.key_pid = pid;
                    // A fresh scanner doubles as the per-PES state reset.
                    self.scanner = Some(IrapScanner::new(codec));

                    if payload.len() >= 9 && payload.starts_with(&[0, 0, 1]) {
                        let pts_dts_flags = payload[7] >> 6;
                        let pes_header_length = payload[8] as usize;
                        if pts_dts_flags >= 2 && payload.len() >= 14 {
                            self.update_pts(tsmemseg_ts::pes::read_pes_timestamp(&payload[9..14]));
                        }
                        self.maybe_mark_fragment();
                        if 9 + pes_header_length < payload.len() {
                            is_key = self.scan_irap(&payload[9 + pes_header_length..]);
                        }
                    }
                } else if pid == self.key_pid {
                    is_key = self.scan_irap(payload);
                }
            }
        } else if video_pid == 0 && audio_pid != 0 && pid == audio_pid && unit_start {
            // No video: every audio unit-start is a random access point.
            self.snapshot_before_key();
            self.key_pid = pid;
            if payload.len() >= 14 && payload.starts_with(&[0, 0, 1]) && payload[7] >> 6 >= 2 {
                self.update_pts(tsmemseg_ts::pes::read_pes_timestamp(&payload[9..14]));
            }
            is_key = !self.is_first_key;
            self.is_first_key = false;
        }

        let flush = self.decide_boundary(is_key);
        self.packets.extend_from_slice(chunk);
        flush
    }

    /// Flush whatever is accumulated at end of input, in arrival order.
    pub fn flush_eof(&mut self) -> Option<Flush> {
        if self.packets.is_empty() {
            return None;
        }
        let duration_msec = self.take_segment_duration();
        let packets = std::mem::take(&mut self.packets);
        self.unit_starts.clear();
        self.marked_frag_pts = None;
        self.emitted_seg_bytes = 0;
        Some(Flush {
            kind: FlushKind::Eof,
            packets,
            duration_msec,
        })
    }

    fn update_pts(&mut self, pts: u64) {
        self.pts = pts;
        if !self.pts_initialized {
            self.last_seg_pts = pts;
            self.last_frag_pts = pts;
            self.pts_initialized = true;
        }
    }

    fn scan_irap(&mut self, payload: &[u8]) -> bool {
        let Some(scanner) = &mut self.scanner else {
            return false;
        };
        if scanner.scan(payload) {
            let usable = !self.is_first_key;
            self.is_first_key = false;
            usable
        } else {
            false
        }
    }

    fn snapshot_before_key(&mut self) {
        for record in self.unit_starts.values_mut() {
            record.before_key = record.last;
        }
    }

    /// Mark this key unit-start for fragmentation when the fragment target
    /// has elapsed and, if the PMT advertises audio, audio has arrived.
    fn maybe_mark_fragment(&mut self) {
        if !self.fragmentation || !self.pts_initialized || self.marked_frag_pts.is_some() {
            return;
        }
        let audio_pid = self.pat.first_pmt.first_adts_audio_pid;
        if audio_pid != 0 && !self.audio_arrived {
            return;
        }
        let elapsed_msec = forward_diff(self.pts, self.last_frag_pts).unwrap_or(0) / 90;
        if elapsed_msec >= self.config.target_frag_duration_msec as u64 {
            self.marked_frag_pts = Some(self.pts);
            for record in self.unit_starts.values_mut() {
                record.before_marked_key = record.last;
            }
        }
    }

    fn decide_boundary(&mut self, is_key: bool) -> Option<Flush> {
        let pts_diff = if self.pts_initialized {
            forward_diff(self.pts, self.last_seg_pts).unwrap_or(0)
        } else {
            0
        };
        let is_segment_key =
            is_key && pts_diff >= self.config.target_duration_msec as u64 * 90;
        let force = (self.config.seg_max_bytes != 0
            && self.packets.len() + self.emitted_seg_bytes + packet::PACKET_SIZE
                > self.config.seg_max_bytes)
            || self.packets.len() + packet::PACKET_SIZE > ACCUMULATION_MAX_BYTES;
        let create_fragment = self.marked_frag_pts.is_some_and(|marked| {
            forward_diff(self.pts, marked).unwrap_or(0) / 90
                >= self.config.target_frag_duration_msec as u64 / 4
        });

        if is_key || force {
            let flush = if is_segment_key {
                let duration_msec = self.take_segment_duration();
                let packets = self.split_off_run(SplitAt::BeforeKey);
                self.emitted_seg_bytes = 0;
                Some(Flush {
                    kind: FlushKind::Segment,
                    packets,
                    duration_msec,
                })
            } else if force && !is_key {
                self.forced_segmentations += 1;
                let duration_msec = self.take_segment_duration();
                let packets = std::mem::take(&mut self.packets);
                self.emitted_seg_bytes = 0;
                Some(Flush {
                    kind: FlushKind::Forced,
                    packets,
                    duration_msec,
                })
            } else {
                None
            };
            self.unit_starts.clear();
            self.marked_frag_pts = None;
            if flush.is_some() {
                self.last_frag_pts = self.pts;
                // The initial target applies to the first segment only.
                self.config.target_duration_msec = self.config.next_target_duration_msec;
            }
            return flush;
        }

        if create_fragment {
            let packets = self.split_off_run(SplitAt::BeforeMarkedKey);
            self.unit_starts.clear();
            self.marked_frag_pts = None;
            self.last_frag_pts = self.pts;
            if packets.is_empty() {
                return None;
            }
            return Some(Flush {
                kind: FlushKind::Fragment,
                packets,
                duration_msec: 0,
            });
        }

        None
    }

    /// Segment duration from the accumulated PTS delta, with a 90 kHz
    /// residual accumulator so the reported milliseconds never drift.
    fn take_segment_duration(&mut self) -> u32 {
        let pts_diff = if self.pts_initialized {
            forward_diff(self.pts, self.last_seg_pts).unwrap_or(0)
        } else {
            0
        };
        let mut duration_msec = (pts_diff / 90) as u32;
        self.duration_residual_90k += (pts_diff % 90) as u32;
        duration_msec += self.duration_residual_90k / 90;
        self.duration_residual_90k %= 90;
        self.last_seg_pts = self.pts;
        duration_msec
    }

    /// Split the buffer at the recorded key position: PAT and PMT are
    /// front-loaded (at most one of each, PAT first), complete PES
    /// continuations stay in the run, and everything at or after the split
    /// (plus unit-start carriers straddling it) becomes the next buffer.
    fn split_off_run(&mut self, at: SplitAt) -> Vec<u8> {
        let split = self
            .unit_starts
            .get(&self.key_pid)
            .map_or(0, |record| match at {
                SplitAt::BeforeKey => record.before_key,
                SplitAt::BeforeMarkedKey => record.before_marked_key,
            });
        let pmt_pid = self.pat.first_pmt.pmt_pid;

        let mut run = Vec::with_capacity(self.packets.len());
        let mut carry = Vec::new();

        let mut bring_state = 0u8;
        let mut i = 0;
        while i < self.packets.len() && i < split && bring_state < 2 {
            let chunk = &self.packets[i..i + packet::PACKET_SIZE];
            let p = packet::pid(chunk);
            if p == 0 || p == pmt_pid {
                bring_state = advance_bring_state(bring_state, p);
                run.extend_from_slice(chunk);
            }
            i += packet::PACKET_SIZE;
        }

        let mut bring_state = 0u8;
        let mut i = 0;
        while i < self.packets.len() {
            let chunk = &self.packets[i..i + packet::PACKET_SIZE];
            if i < split {
                let p = packet::pid(chunk);
                if (p == 0 || p == pmt_pid) && bring_state < 2 {
                    // Front-loaded above.
                    bring_state = advance_bring_state(bring_state, p);
                } else {
                    let complete_before_split = match self.unit_starts.get(&p) {
                        None => true,
                        Some(record) => {
                            let limit = record.last.min(match at {
                                SplitAt::BeforeKey => record.before_key,
                                SplitAt::BeforeMarkedKey => record.before_marked_key,
                            });
                            i < limit
                        }
                    };
                    if complete_before_split {
                        run.extend_from_slice(chunk);
                    } else {
                        carry.extend_from_slice(chunk);
                    }
                }
            } else {
                carry.extend_from_slice(chunk);
            }
            i += packet::PACKET_SIZE;
        }

        self.packets = carry;
        run
    }
}

#[derive(Clone, Copy)]
enum SplitAt {
    BeforeKey,
    BeforeMarkedKey,
}

fn advance_bring_state(state: u8, pid: u16) -> u8 {
    if pid == 0 {
        1
    } else if state == 1 {
        2
    } else {
        state
    }
}
