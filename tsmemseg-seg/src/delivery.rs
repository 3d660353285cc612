//! The delivery loop.
//!
//! One background thread serves every slot: it opportunistically accepts
//! readers on all endpoints, snapshots the slot buffer under the ring
//! lock, and pushes the bytes out with a single `poll` across all active
//! pipes. A reader that disappears mid-write (EPIPE) is dropped and the
//! slot's back buffer, if populated, is swapped in.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::endpoint::{EndpointWriter, SegmentEndpoint};
use crate::ring::Ring;

/// Poll timeout; also the cadence of accept attempts and stop checks.
const POLL_INTERVAL_MSEC: i32 = 50;

struct ActiveWrite {
    writer: Box<dyn EndpointWriter>,
    data: Vec<u8>,
    written: usize,
}

/// Serve readers until the ring's stop flag flips.
///
/// `endpoints[i]` corresponds to ring slot `i` (slot 0 being the index).
pub fn delivery_loop(ring: Arc<Ring>, mut endpoints: Vec<Box<dyn SegmentEndpoint>>) {
    let mut active: Vec<Option<ActiveWrite>> = Vec::new();
    active.resize_with(endpoints.len(), || None);

    while !ring.stop.load(std::sync::atomic::Ordering::Relaxed) {
        // Accept phase: attach at most one reader per idle slot.
        for (index, endpoint) in endpoints.iter_mut().enumerate() {
            if active[index].is_some() {
                continue;
            }
            match endpoint.accept_reader() {
                Ok(Some(writer)) => {
                    ring.touch_access();
                    let data = {
                        let mut slots = ring.slots.lock();
                        slots[index].connected = true;
                        slots[index].buf.clone()
                    };
                    trace!(slot = index, bytes = data.len(), "reader attached");
                    active[index] = Some(ActiveWrite {
                        writer,
                        data,
                        written: 0,
                    });
                }
                Ok(None) => {}
                Err(_) => {
                    // Endpoint briefly unavailable; retried next round.
                }
            }
        }

        // Poll phase over all active pipes.
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut poll_slots: Vec<usize> = Vec::new();
        for (index, write) in active.iter().enumerate() {
            if let Some(write) = write {
                pollfds.push(libc::pollfd {
                    fd: write.writer.raw_fd(),
                    events: libc::POLLOUT,
                    revents: 0,
                });
                poll_slots.push(index);
            }
        }
        if pollfds.is_empty() {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MSEC as u64));
            continue;
        }
        unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, POLL_INTERVAL_MSEC);
        }

        // Write phase.
        for (pollfd, &index) in pollfds.iter().zip(&poll_slots) {
            if pollfd.revents == 0 {
                continue;
            }
            let Some(write) = active[index].as_mut() else {
                continue;
            };
            let finished = if pollfd.revents & (libc::POLLERR | libc::POLLHUP) != 0
                && pollfd.revents & libc::POLLOUT == 0
            {
                true
            } else {
                match write.writer.write_some(&write.data[write.written..]) {
                    Ok(n) => {
                        write.written += n;
                        write.written >= write.data.len()
                    }
                    Err(_) => true, // EPIPE or similar: drop the write
                }
            };
            if finished {
                trace!(slot = index, bytes = write.written, "reader served");
                active[index] = None;
                finish_slot(&ring, index);
            }
        }
    }

    // Cooperative shutdown: drop active writers, release slot flags.
    for (index, write) in active.iter_mut().enumerate() {
        if write.take().is_some() {
            finish_slot(&ring, index);
        }
    }
}

/// Release a slot after its reader detached, swapping in the pending back
/// buffer when one exists.
fn finish_slot(ring: &Ring, index: usize) {
    let mut slots = ring.slots.lock();
    let slot = &mut slots[index];
    slot.connected = false;
    if !slot.back_buf.is_empty() {
        std::mem::swap(&mut slot.buf, &mut slot.back_buf);
        slot.back_buf = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::FifoEndpoint;
    use std::fs::File;
    use std::io::Read;
    use std::sync::atomic::Ordering;

    fn ring_with_content(seg_num: usize, content: &[u8]) -> Arc<Ring> {
        let ring = Arc::new(Ring::new(seg_num, false));
        {
            let mut slots = ring.slots.lock();
            slots[1].buf = content.to_vec();
            slots[1].seg_count = 1;
        }
        ring
    }

    #[test]
    fn test_reader_receives_full_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ring = ring_with_content(2, b"hello segment");
        let mut endpoints: Vec<Box<dyn SegmentEndpoint>> = Vec::new();
        for i in 0..3 {
            endpoints.push(Box::new(
                FifoEndpoint::create(dir.path().join(format!("seg{i:02}.fifo"))).unwrap(),
            ));
        }
        let path = dir.path().join("seg01.fifo");

        let delivery_ring = ring.clone();
        let delivery = std::thread::spawn(move || delivery_loop(delivery_ring, endpoints));

        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello segment");

        // A second reader gets the same complete content.
        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello segment");

        ring.stop.store(true, Ordering::Relaxed);
        delivery.join().unwrap();
    }

    #[test]
    fn test_back_buffer_swaps_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let ring = ring_with_content(1, b"old version");
        {
            let mut slots = ring.slots.lock();
            slots[1].back_buf = b"new version".to_vec();
        }
        let endpoints: Vec<Box<dyn SegmentEndpoint>> = vec![
            Box::new(FifoEndpoint::create(dir.path().join("seg00.fifo")).unwrap()),
            Box::new(FifoEndpoint::create(dir.path().join("seg01.fifo")).unwrap()),
        ];
        let path = dir.path().join("seg01.fifo");

        let delivery_ring = ring.clone();
        let delivery = std::thread::spawn(move || delivery_loop(delivery_ring, endpoints));

        // First read sees the old version; the swap happens on disconnect.
        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"old version");

        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"new version");

        assert!(ring.idle_msec() < 2000);

        ring.stop.store(true, Ordering::Relaxed);
        delivery.join().unwrap();
    }
}
