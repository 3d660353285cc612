//! Process wiring: ingest loop, publishing, lifecycle.
//!
//! The ingest thread reads stdin in 16-packet chunks, runs the segmenter,
//! and publishes flushed runs either into the ring (ring mode) or onto
//! stdout (stream mode, endpoint name `-`). Idle timeout, the closing
//! command and signal-time endpoint cleanup live here too.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, info, warn};
use tsmemseg_mp4::Mp4Fragmenter;
use tsmemseg_ts::packet;

use crate::delivery::delivery_loop;
use crate::endpoint::{endpoint_path, FifoEndpoint, SegmentEndpoint};
use crate::error::{Result, SegError};
use crate::pacing::{ReadPacer, PACE_SLEEP_MSEC};
use crate::ring::{build_index, write_segment_header, Ring};
use crate::segmenter::{Flush, FlushKind, Segmenter, SegmenterConfig};

/// Everything the CLI resolved.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Emit fragmented MP4 segments instead of TS passthrough.
    pub mp4: bool,
    /// Initial target segment duration in milliseconds.
    pub target_duration_msec: u32,
    /// Steady-state target segment duration in milliseconds.
    pub next_target_duration_msec: u32,
    /// Target fragment duration inside a segment; 0 disables fragments.
    pub target_frag_duration_msec: u32,
    /// Idle access timeout in milliseconds; 0 disables it.
    pub access_timeout_msec: u32,
    /// Shell command to run once when the idle timeout fires.
    pub closing_command: Option<String>,
    /// Steady read rate in per mille of real time; 0 is unthrottled.
    pub read_rate_permille: u32,
    /// Read rate until the ring has filled.
    pub fill_read_rate_permille: u32,
    /// Number of payload slots in the ring.
    pub seg_num: usize,
    /// Maximum bytes per segment.
    pub seg_max_bytes: usize,
    /// Endpoint base name, or `-` for stream mode.
    pub name: String,
}

/// Counters surfaced at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    /// Packets dropped for a bad sync byte.
    pub sync_errors: u64,
    /// Segments cut by a byte budget without a random access point.
    pub forced_segmentations: u64,
}

/// Run the segmenter over `input` until EOF or idle timeout.
pub fn run(config: RunnerConfig, input: impl Read) -> Result<RunStats> {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    if config.name == "-" {
        run_stream(config, input)
    } else {
        run_ring(config, input)
    }
}

fn segmenter_config(config: &RunnerConfig) -> SegmenterConfig {
    SegmenterConfig {
        target_duration_msec: config.target_duration_msec,
        next_target_duration_msec: config.next_target_duration_msec,
        target_frag_duration_msec: config.target_frag_duration_msec,
        seg_max_bytes: config.seg_max_bytes,
    }
}

/// A destination for flushed packet runs. Returns the duration the flush
/// contributed to the published timeline (for pacing).
trait FlushSink {
    fn publish(&mut self, flush: Flush, segmenter: &mut Segmenter) -> Result<u32>;
}

// =============================================================================
// Ring mode
// =============================================================================

fn run_ring(config: RunnerConfig, input: impl Read) -> Result<RunStats> {
    let ring = Arc::new(Ring::new(config.seg_num, config.mp4));

    let mut endpoints: Vec<Box<dyn SegmentEndpoint>> = Vec::new();
    let mut paths: Vec<PathBuf> = Vec::new();
    for i in 0..=config.seg_num {
        let path = endpoint_path(&config.name, i);
        match FifoEndpoint::create(path.clone()) {
            Ok(endpoint) => {
                endpoints.push(Box::new(endpoint));
                paths.push(path);
            }
            Err(source) => {
                for endpoint in &mut endpoints {
                    endpoint.destroy();
                }
                return Err(SegError::EndpointCreation {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
    }
    install_signal_cleanup(&paths);
    info!(name = %config.name, slots = config.seg_num, mp4 = config.mp4, "ring ready");

    let delivery = {
        let ring = ring.clone();
        std::thread::spawn(move || delivery_loop(ring, endpoints))
    };

    let mut segmenter = Segmenter::new(segmenter_config(&config), config.mp4);
    let mut pacer = ReadPacer::new(config.fill_read_rate_permille, config.read_rate_permille);
    let mut publisher = RingPublisher {
        ring: &ring,
        fragmenter: config.mp4.then(Mp4Fragmenter::new),
        seg_index: 1,
        seg_num: config.seg_num,
        seg_count: 0,
        entire_time_msec: 0,
        building: None,
    };

    let (sync_errors, timed_out) = ingest_loop(
        input,
        &mut segmenter,
        &mut pacer,
        Some(ring.as_ref()),
        config.access_timeout_msec,
        &mut publisher,
    )?;

    if !timed_out {
        if let Some(flush) = segmenter.flush_eof() {
            publisher.publish(flush, &mut segmenter)?;
        }
    }

    let stats = RunStats {
        sync_errors,
        forced_segmentations: segmenter.forced_segmentations(),
    };
    print_warnings(&stats);

    // Give readers until the idle timeout to drain the tail.
    while config.access_timeout_msec != 0
        && ring.idle_msec() < config.access_timeout_msec as u64
    {
        std::thread::sleep(Duration::from_millis(100));
    }

    if config.access_timeout_msec != 0 {
        if let Some(command) = &config.closing_command {
            spawn_closing_command(command);
        }
    }

    // Flip the index to end-of-list before tearing the ring down.
    {
        let init = publisher
            .fragmenter
            .as_ref()
            .map(|f| f.header().to_vec())
            .unwrap_or_default();
        let mut slots = ring.slots.lock();
        let index = build_index(&slots, publisher.seg_index, true, false, config.mp4, &init);
        *slots[0].writable_buf() = index;
    }

    ring.stop.store(true, Ordering::Relaxed);
    let _ = delivery.join();
    for path in &paths {
        let _ = std::fs::remove_file(path);
    }
    Ok(stats)
}

/// The fMP4 segment currently being appended to its slot.
struct SegmentBuilder {
    slot: usize,
    seg_count: u32,
    data: Vec<u8>,
    frag_sizes: Vec<u32>,
    frag_durations: Vec<u32>,
}

struct RingPublisher<'a> {
    ring: &'a Ring,
    fragmenter: Option<Mp4Fragmenter>,
    /// Next slot to claim, in 1..=seg_num.
    seg_index: usize,
    seg_num: usize,
    seg_count: u32,
    entire_time_msec: u32,
    building: Option<SegmentBuilder>,
}

impl RingPublisher<'_> {
    fn claim_slot(&mut self) -> (usize, u32) {
        let slot = self.seg_index;
        self.seg_index = self.seg_index % self.seg_num + 1;
        self.seg_count = (self.seg_count + 1) & 0x00FF_FFFF;
        (slot, self.seg_count)
    }

    /// Rewrite a slot and the index under one lock hold.
    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        slot_index: usize,
        seg_count: u32,
        payload: &[u8],
        duration_msec: u32,
        seg_time_msec: u32,
        frag_sizes: &[u32],
        frag_durations: &[u32],
        incomplete: bool,
        init_header: &[u8],
    ) {
        let is_mp4 = self.ring.is_mp4();
        let mut slots = self.ring.slots.lock();
        {
            let slot = &mut slots[slot_index];
            slot.seg_count = seg_count;
            slot.seg_duration_msec = duration_msec;
            slot.seg_time_msec = seg_time_msec;
            slot.frag_durations_msec = frag_durations.to_vec();
            let buf = slot.writable_buf();
            buf.clear();
            buf.resize(188, 0);
            buf.extend_from_slice(payload);
            write_segment_header(buf, seg_count, is_mp4, frag_sizes);
        }
        let index = build_index(&slots, self.seg_index, false, incomplete, is_mp4, init_header);
        *slots[0].writable_buf() = index;
    }
}

impl FlushSink for RingPublisher<'_> {
    fn publish(&mut self, flush: Flush, segmenter: &mut Segmenter) -> Result<u32> {
        let mut fragmenter = match self.fragmenter.take() {
            None => {
                // TS passthrough: every flush closes a segment.
                if flush.packets.is_empty() {
                    return Ok(0);
                }
                let (slot, seg_count) = self.claim_slot();
                self.entire_time_msec += flush.duration_msec;
                self.store(
                    slot,
                    seg_count,
                    &flush.packets,
                    flush.duration_msec,
                    self.entire_time_msec,
                    &[],
                    &[],
                    false,
                    &[],
                );
                debug!(seg_count, duration_msec = flush.duration_msec, "segment published");
                return Ok(flush.duration_msec);
            }
            Some(fragmenter) => fragmenter,
        };

        let forced = flush.kind == FlushKind::Forced;
        fragmenter.add_packets(&flush.packets, &segmenter.pat().first_pmt, forced);
        let new_bytes = fragmenter.fragments().to_vec();
        let new_sizes: Vec<u32> = fragmenter.fragment_sizes().iter().map(|&s| s as u32).collect();
        let new_durations = fragmenter.fragment_durations_msec().to_vec();
        fragmenter.clear_fragments();
        segmenter.add_emitted_segment_bytes(new_bytes.len());

        if self.building.is_none() && new_bytes.is_empty() {
            self.fragmenter = Some(fragmenter);
            return Ok(0);
        }
        let mut builder = match self.building.take() {
            Some(builder) => builder,
            None => {
                let (slot, seg_count) = self.claim_slot();
                SegmentBuilder {
                    slot,
                    seg_count,
                    data: Vec::new(),
                    frag_sizes: Vec::new(),
                    frag_durations: Vec::new(),
                }
            }
        };
        builder.data.extend_from_slice(&new_bytes);
        builder.frag_sizes.extend_from_slice(&new_sizes);
        builder.frag_durations.extend_from_slice(&new_durations);

        let init = fragmenter.header().to_vec();
        let closing = flush.kind != FlushKind::Fragment;
        let duration_msec = if closing {
            flush.duration_msec
        } else {
            builder.frag_durations.iter().sum()
        };
        let seg_time = if closing {
            self.entire_time_msec + flush.duration_msec
        } else {
            self.entire_time_msec
        };
        self.store(
            builder.slot,
            builder.seg_count,
            &builder.data,
            duration_msec,
            seg_time,
            &builder.frag_sizes,
            &builder.frag_durations,
            !closing,
            &init,
        );

        let paced = if closing {
            self.entire_time_msec = seg_time;
            debug!(
                seg_count = builder.seg_count,
                duration_msec,
                fragments = builder.frag_sizes.len(),
                "fMP4 segment published"
            );
            flush.duration_msec
        } else {
            self.building = Some(builder);
            0
        };
        self.fragmenter = Some(fragmenter);
        Ok(paced)
    }
}

// =============================================================================
// Stream mode
// =============================================================================

fn run_stream(config: RunnerConfig, input: impl Read) -> Result<RunStats> {
    let stdout = io::stdout();
    let mut segmenter = Segmenter::new(segmenter_config(&config), config.mp4);
    // No ring to fill: the steady rate applies from the start.
    let mut pacer = ReadPacer::new(config.read_rate_permille, config.read_rate_permille);
    let mut sink = StreamSink {
        out: stdout.lock(),
        fragmenter: config.mp4.then(Mp4Fragmenter::new),
        header_written: false,
    };

    let (sync_errors, _) = ingest_loop(input, &mut segmenter, &mut pacer, None, 0, &mut sink)?;
    if let Some(flush) = segmenter.flush_eof() {
        sink.publish(flush, &mut segmenter)?;
    }
    let _ = sink.out.flush();

    let stats = RunStats {
        sync_errors,
        forced_segmentations: segmenter.forced_segmentations(),
    };
    print_warnings(&stats);
    Ok(stats)
}

struct StreamSink<W: Write> {
    out: W,
    fragmenter: Option<Mp4Fragmenter>,
    header_written: bool,
}

impl<W: Write> FlushSink for StreamSink<W> {
    fn publish(&mut self, flush: Flush, segmenter: &mut Segmenter) -> Result<u32> {
        match &mut self.fragmenter {
            None => {
                self.out.write_all(&flush.packets)?;
            }
            Some(fragmenter) => {
                let forced = flush.kind == FlushKind::Forced;
                fragmenter.add_packets(&flush.packets, &segmenter.pat().first_pmt, forced);
                if !self.header_written && !fragmenter.header().is_empty() {
                    self.out.write_all(fragmenter.header())?;
                    self.header_written = true;
                }
                self.out.write_all(fragmenter.fragments())?;
                fragmenter.clear_fragments();
            }
        }
        self.out.flush()?;
        Ok(flush.duration_msec)
    }
}

// =============================================================================
// Ingest loop
// =============================================================================

/// Read 188x16-byte chunks, keep packet alignment across reads, and feed
/// the segmenter. Returns the sync-error count and whether the idle
/// timeout ended the run.
fn ingest_loop(
    mut input: impl Read,
    segmenter: &mut Segmenter,
    pacer: &mut ReadPacer,
    ring: Option<&Ring>,
    access_timeout_msec: u32,
    sink: &mut dyn FlushSink,
) -> Result<(u64, bool)> {
    let mut buf = [0u8; 188 * 16];
    let mut buf_count = 0usize;
    let mut sync_errors = 0u64;

    loop {
        let n = match input.read(&mut buf[buf_count..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        buf_count += n;

        loop {
            if let Some(ring) = ring {
                if access_timeout_msec != 0 && ring.idle_msec() >= access_timeout_msec as u64 {
                    info!("idle timeout reached, stopping ingest");
                    return Ok((sync_errors, true));
                }
            }
            pacer.maybe_switch(ring.map_or(true, Ring::all_populated));
            if pacer.over_budget(segmenter.pending_duration_msec()) {
                std::thread::sleep(Duration::from_millis(PACE_SLEEP_MSEC));
                continue;
            }
            break;
        }

        let whole = buf_count / 188 * 188;
        for offset in (0..whole).step_by(188) {
            let chunk_end = offset + 188;
            if packet::sync_byte(&buf[offset..chunk_end]) != packet::SYNC_BYTE {
                // No resynchronization: count and drop.
                sync_errors += 1;
                continue;
            }
            if let Some(flush) = segmenter.push_packet(&buf[offset..chunk_end]) {
                let duration = sink.publish(flush, segmenter)?;
                pacer.on_segment(duration);
            }
        }
        buf.copy_within(whole..buf_count, 0);
        buf_count -= whole;
    }
    Ok((sync_errors, false))
}

fn print_warnings(stats: &RunStats) {
    if stats.sync_errors > 0 {
        eprintln!("Warning: {} sync error happened.", stats.sync_errors);
    }
    if stats.forced_segmentations > 0 {
        eprintln!(
            "Warning: {} forced segmentation happened.",
            stats.forced_segmentations
        );
    }
}

fn spawn_closing_command(command: &str) {
    debug!(command, "running closing command");
    match std::process::Command::new("sh").arg("-c").arg(command).spawn() {
        Ok(_child) => {}
        Err(err) => warn!(%err, "closing command failed to start"),
    }
}

// =============================================================================
// Signal cleanup
// =============================================================================

static CLEANUP_PATHS: OnceLock<Vec<CString>> = OnceLock::new();

extern "C" fn cleanup_on_signal(sig: libc::c_int) {
    if let Some(paths) = CLEANUP_PATHS.get() {
        for path in paths {
            unsafe {
                libc::unlink(path.as_ptr());
            }
        }
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Unlink the endpoints before dying on HUP/INT/TERM, then re-raise with
/// the default disposition.
fn install_signal_cleanup(paths: &[PathBuf]) {
    let c_paths: Vec<CString> = paths
        .iter()
        .filter_map(|p| CString::new(p.as_os_str().as_bytes()).ok())
        .collect();
    let _ = CLEANUP_PATHS.set(c_paths);
    unsafe {
        let handler = cleanup_on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
            libc::signal(sig, handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = RunStats::default();
        assert_eq!(stats.sync_errors, 0);
        assert_eq!(stats.forced_segmentations, 0);
    }
}
