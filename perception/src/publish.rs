//! L.I: non-blocking fan-out of per-frame artefacts to downstream
//! subscribers. Mirrors the listener-list pattern used for model servers
//! upstream, but narrowed to a trait so this crate never depends on a
//! transport (websocket, SSE, shared memory) to publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{FrameArtifacts, ResetEvent};

/// A subscriber of per-frame pipeline output. Implementations receive
/// owned, deep-copied data — never a live reference into tracker or grid
/// state — so they are free to hold it across thread or task boundaries.
pub trait PublishSink: Send + Sync {
    fn publish_frame(&self, artifacts: &FrameArtifacts);
    fn publish_reset(&self, _event: ResetEvent) {}
}

/// Fans a single publication out to every registered subscriber, in
/// registration order, completing publication for frame N before
/// publication begins for frame N+1 (the orchestrator never calls
/// `publish_frame` concurrently for two frames of the same sensor).
#[derive(Default)]
pub struct PublishBroadcaster {
    subscribers: Mutex<Vec<Arc<dyn PublishSink>>>,
    dropped: AtomicU64,
}

impl PublishBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn PublishSink>) {
        self.subscribers.lock().push(sink);
    }

    pub fn publish_frame(&self, artifacts: &FrameArtifacts) {
        let subs = self.subscribers.lock();
        for sub in subs.iter() {
            sub.publish_frame(artifacts);
        }
    }

    pub fn publish_reset(&self, event: ResetEvent) {
        let subs = self.subscribers.lock();
        for sub in subs.iter() {
            sub.publish_reset(event);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A subscriber backed by a bounded channel, for a consumer that lives on
/// another thread and should never be allowed to stall publication: overflow
/// drops the oldest artefact already queued in the channel and counts it,
/// the same drop-oldest policy the frame callback queue uses.
pub struct ChannelSink {
    tx: Mutex<crossbeam_channel::Sender<FrameArtifacts>>,
    rx: crossbeam_channel::Receiver<FrameArtifacts>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Arc::new(Self { tx: Mutex::new(tx), rx, dropped: AtomicU64::new(0) })
    }

    pub fn receiver(&self) -> crossbeam_channel::Receiver<FrameArtifacts> {
        self.rx.clone()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PublishSink for ChannelSink {
    fn publish_frame(&self, artifacts: &FrameArtifacts) {
        let tx = self.tx.lock();
        let mut pending = artifacts.clone();
        loop {
            match tx.try_send(pending) {
                Ok(()) => return,
                Err(crossbeam_channel::TrySendError::Full(rejected)) => {
                    pending = rejected;
                    if self.rx.try_recv().is_ok() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(total_dropped = total, "publish subscriber channel full, dropping oldest frame");
                    }
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(AtomicUsize);

    impl PublishSink for CountingSink {
        fn publish_frame(&self, _artifacts: &FrameArtifacts) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn artifacts() -> FrameArtifacts {
        FrameArtifacts {
            sensor_id: 0,
            frame_id: 0,
            wall_clock_ns: 0,
            clusters: vec![],
            confirmed_tracks: vec![],
            foreground_mask: vec![],
        }
    }

    #[test]
    fn broadcasts_to_every_subscriber() {
        let broadcaster = PublishBroadcaster::new();
        let a = Arc::new(CountingSink(AtomicUsize::new(0)));
        let b = Arc::new(CountingSink(AtomicUsize::new(0)));
        broadcaster.subscribe(a.clone());
        broadcaster.subscribe(b.clone());

        broadcaster.publish_frame(&artifacts());

        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn channel_sink_delivers_published_frame() {
        let sink = ChannelSink::new(4);
        let rx = sink.receiver();
        sink.publish_frame(&artifacts());
        assert!(rx.recv_timeout(std::time::Duration::from_secs(1)).is_ok());
    }
}
