//! L2: accumulates per-packet polar points into complete 360-degree frames
//! and hands finalized frames to a single downstream worker.
//!
//! Frame boundary detection watches for the azimuth wrapping past a
//! configured anchor angle; an idle frame is force-finalized after
//! `buffer_timeout_ns` so a sensor dropout does not wedge the pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{Frame, PolarPoint};

#[derive(Debug, Clone)]
pub struct FrameBuilderConfig {
    pub anchor_azimuth_deg: f64,
    pub buffer_timeout_ns: i64,
    pub num_rings: usize,
    pub channel_capacity: usize,
}

impl Default for FrameBuilderConfig {
    fn default() -> Self {
        Self {
            anchor_azimuth_deg: 0.0,
            buffer_timeout_ns: 500_000_000,
            num_rings: 40,
            channel_capacity: 8,
        }
    }
}

/// Bounded, drop-oldest queue of finalized frames feeding a single worker.
///
/// A plain `crossbeam_channel::bounded` blocks the producer when full, which
/// would stall packet ingestion. Frame delivery instead keeps a small ring
/// buffer under a mutex and uses the channel purely as a wake-up signal, so
/// overflow can drop the oldest pending frame instead of blocking.
struct FrameQueue {
    pending: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify_tx: crossbeam_channel::Sender<()>,
    notify_rx: crossbeam_channel::Receiver<()>,
    dropped: AtomicU64,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify_tx,
            notify_rx,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: Frame) {
        let mut q = self.pending.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total_dropped = total, "frame callback queue full, dropping oldest frame");
        }
        q.push_back(frame);
        drop(q);
        // Best-effort wake-up: if a signal is already pending the worker
        // will drain everything anyway, so a full `try_send` is not an error.
        let _ = self.notify_tx.try_send(());
    }

    fn pop(&self) -> Option<Frame> {
        self.pending.lock().pop_front()
    }
}

/// Accumulates polar points and finalizes frames by azimuth wrap or idle
/// timeout, serializing delivery to a single subscriber.
pub struct FrameBuilder {
    config: FrameBuilderConfig,
    current: Vec<PolarPoint>,
    last_azimuth: Option<f64>,
    frame_start_ns: i64,
    next_frame_id: u64,
    queue: Arc<FrameQueue>,
    malformed_points: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl FrameBuilder {
    pub fn new(config: FrameBuilderConfig) -> Self {
        Self {
            queue: Arc::new(FrameQueue::new(config.channel_capacity)),
            config,
            current: Vec::new(),
            last_azimuth: None,
            frame_start_ns: 0,
            next_frame_id: 0,
            malformed_points: AtomicU64::new(0),
            worker: None,
        }
    }

    pub fn dropped_frame_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn malformed_point_count(&self) -> u64 {
        self.malformed_points.load(Ordering::Relaxed)
    }

    /// Appends points into the in-progress frame, finalizing it first if the
    /// azimuth wraps past the anchor or the current frame has gone idle.
    pub fn add_points(&mut self, points: &[PolarPoint], arrival_ns: i64) {
        for p in points {
            if !p.is_valid(self.config.num_rings) {
                self.malformed_points.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if self.current.is_empty() {
                self.frame_start_ns = arrival_ns;
            } else if arrival_ns - self.frame_start_ns > self.config.buffer_timeout_ns {
                self.finalize(arrival_ns);
                self.frame_start_ns = arrival_ns;
            }

            if let Some(last) = self.last_azimuth {
                if wrapped_past_anchor(last, p.azimuth_deg, self.config.anchor_azimuth_deg) {
                    self.finalize(arrival_ns);
                    self.frame_start_ns = arrival_ns;
                }
            }

            self.last_azimuth = Some(p.azimuth_deg);
            self.current.push(*p);
        }
    }

    /// May force-finalize an idle frame; called periodically by the
    /// orchestrator even when no new packets have arrived.
    pub fn on_tick(&mut self, now_ns: i64) {
        if !self.current.is_empty() && now_ns - self.frame_start_ns > self.config.buffer_timeout_ns {
            self.finalize(now_ns);
        }
    }

    fn finalize(&mut self, now_ns: i64) {
        if self.current.is_empty() {
            return;
        }
        let frame = Frame {
            frame_id: self.next_frame_id,
            wall_clock_ns: now_ns,
            points: std::mem::take(&mut self.current),
        };
        self.next_frame_id += 1;
        self.last_azimuth = None;
        self.queue.push(frame);
    }

    /// Spawns the single worker thread that drains finalized frames in
    /// order, running `callback` to completion before picking up the next
    /// one. Dropping the returned guard stops the worker.
    pub fn subscribe<F>(&mut self, mut callback: F) -> FrameBuilderWorkerGuard
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let queue = self.queue.clone();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(queue.notify_rx) -> _ => {
                    while let Some(frame) = queue.pop() {
                        callback(frame);
                    }
                }
                recv(stop_rx) -> _ => return,
            }
        });
        self.worker = Some(handle);
        FrameBuilderWorkerGuard { _stop_tx: stop_tx }
    }
}

pub struct FrameBuilderWorkerGuard {
    _stop_tx: crossbeam_channel::Sender<()>,
}

fn wrapped_past_anchor(last_deg: f64, current_deg: f64, anchor_deg: f64) -> bool {
    // Measure both samples relative to the anchor so the anchor itself sits
    // at the 0/360 boundary of the comparison; a wrap is then just "azimuth,
    // measured from the anchor, went backwards" regardless of where 0 falls
    // in the sensor's own hardware frame.
    let last_rel = (last_deg - anchor_deg).rem_euclid(360.0);
    let cur_rel = (current_deg - anchor_deg).rem_euclid(360.0);
    cur_rel < last_rel
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pt(az: f64, ring: u16) -> PolarPoint {
        PolarPoint {
            ring_index: ring,
            azimuth_deg: az,
            elevation_deg: 0.0,
            distance_m: 10.0,
            intensity: 1,
            timestamp_ns: 0,
        }
    }

    #[test]
    fn finalizes_on_azimuth_wrap() {
        let mut fb = FrameBuilder::new(FrameBuilderConfig::default());
        let (tx, rx) = mpsc::channel();
        let _guard = fb.subscribe(move |f| tx.send(f).unwrap());

        fb.add_points(&[pt(10.0, 0), pt(200.0, 0), pt(359.0, 0)], 0);
        fb.add_points(&[pt(1.0, 0)], 1_000_000);

        let frame = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(frame.points.len(), 3);
    }

    #[test]
    fn rejects_malformed_points_without_breaking_frame() {
        let mut fb = FrameBuilder::new(FrameBuilderConfig::default());
        fb.add_points(&[pt(1.0, 999), pt(2.0, 0)], 0);
        assert_eq!(fb.malformed_point_count(), 1);
        assert_eq!(fb.current.len(), 1);
    }

    #[test]
    fn idle_timeout_force_finalizes() {
        let mut fb = FrameBuilder::new(FrameBuilderConfig::default());
        let (tx, rx) = mpsc::channel();
        let _guard = fb.subscribe(move |f| tx.send(f).unwrap());

        fb.add_points(&[pt(1.0, 0)], 0);
        fb.on_tick(600_000_000);

        let frame = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(frame.points.len(), 1);
    }

    #[test]
    fn wrapped_past_anchor_detects_crossing_for_nonzero_anchor() {
        // Sweep crosses the anchor directly, with azimuth still increasing
        // in hardware terms (no 360/0 wrap): this is a wrap relative to the
        // anchor.
        assert!(wrapped_past_anchor(170.0, 190.0, 180.0));
        // Hardware wrap (359 -> 1) that does not carry past a 180 anchor.
        assert!(!wrapped_past_anchor(359.0, 1.0, 180.0));
        // Hardware wrap that also carries past the anchor.
        assert!(wrapped_past_anchor(359.0, 1.0, 0.5));
        // Ordinary forward progress with no anchor crossing.
        assert!(!wrapped_past_anchor(170.0, 175.0, 180.0));
    }

    #[test]
    fn finalizes_on_nonzero_anchor_crossing_without_hardware_wrap() {
        let mut fb = FrameBuilder::new(FrameBuilderConfig {
            anchor_azimuth_deg: 180.0,
            ..FrameBuilderConfig::default()
        });
        let (tx, rx) = mpsc::channel();
        let _guard = fb.subscribe(move |f| tx.send(f).unwrap());

        fb.add_points(&[pt(170.0, 0), pt(175.0, 0), pt(179.0, 0)], 0);
        fb.add_points(&[pt(190.0, 0)], 1_000_000);

        let frame = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(frame.points.len(), 3);
    }
}
