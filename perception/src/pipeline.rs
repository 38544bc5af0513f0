//! Pipeline orchestration: a `SensorRuntime` owns every piece of mutable
//! per-sensor state and drives one frame through B..F, then H and I, on a
//! single dedicated worker. A..F, H, and I are otherwise independent; this
//! module is the only place that knows the full stage order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::background::{self, BackgroundGrid, RegionManager};
use crate::classifier;
use crate::cluster::cluster_frame;
use crate::config::PerceptionParams;
use crate::control::{self, DataSource, DataSourceController, DataSourceTransition, GridStatusResponse};
use crate::error::Result;
use crate::frame_builder::{FrameBuilder, FrameBuilderWorkerGuard};
use crate::geometry::{polar_to_cartesian, Pose};
use crate::persistence::{PersistenceBatch, PersistenceSink, PersistenceWriter};
use crate::publish::PublishBroadcaster;
use crate::tracker::Tracker;
use crate::types::{CartesianPoint, Frame, FrameArtifacts, ResetEvent, TrackState};

pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Every piece of mutable state for one sensor, behind the locks the
/// concurrency model requires: a grid lock, a tracker mutex, and a params
/// lock for atomic config patches. Stateless stages (L4, L6) are plain
/// functions called with whatever params are current at the time.
pub struct SensorRuntime {
    sensor_id: u16,
    params: RwLock<PerceptionParams>,
    grid: RwLock<BackgroundGrid>,
    region_manager: Mutex<RegionManager>,
    tracker: Mutex<Tracker>,
    pose: Pose,
    persistence: PersistenceWriter,
    publisher: Arc<PublishBroadcaster>,
    data_source: DataSourceController,
    cancelled: Arc<AtomicBool>,
    frames_processed: AtomicU64,
    frames_throttled: AtomicU64,
    last_processed_ns: Mutex<Option<i64>>,
}

impl SensorRuntime {
    pub fn new(sensor_id: u16, params: PerceptionParams, persistence_sink: Arc<dyn PersistenceSink>) -> Arc<Self> {
        let persistence = PersistenceWriter::new(persistence_sink, &params.pipeline);
        let grid = Self::restore_grid(sensor_id, &params, &persistence).unwrap_or_else(|| BackgroundGrid::new(params.background.clone()));
        let tracker = Tracker::with_cluster_params(params.tracker.clone(), params.cluster.clone(), sensor_id);

        Arc::new(Self {
            sensor_id,
            persistence,
            grid: RwLock::new(grid),
            region_manager: Mutex::new(RegionManager::new()),
            tracker: Mutex::new(tracker),
            pose: Pose::identity(),
            publisher: Arc::new(PublishBroadcaster::new()),
            data_source: DataSourceController::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            frames_processed: AtomicU64::new(0),
            frames_throttled: AtomicU64::new(0),
            last_processed_ns: Mutex::new(None),
            params: RwLock::new(params),
        })
    }

    /// Attempts to rebuild a grid from the persisted background + region
    /// snapshots for `sensor_id`. Returns `None` (cold start) when no
    /// snapshot exists, the region blob fails to decode, or the snapshot's
    /// shape no longer matches the configured grid.
    fn restore_grid(sensor_id: u16, params: &PerceptionParams, persistence: &PersistenceWriter) -> Option<BackgroundGrid> {
        let blob = persistence.get_latest_background_snapshot(sensor_id)?;
        let regions = match persistence.get_latest_region_snapshot(sensor_id) {
            Some(region_blob) => match background::deserialize_regions(&region_blob) {
                Ok(regions) => regions,
                Err(e) => {
                    warn!(sensor_id, error = %e, "failed to decode persisted region snapshot, restoring without regions");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        match BackgroundGrid::restore(params.background.clone(), &blob, regions) {
            Ok(grid) => {
                info!(sensor_id, "restored background grid from persisted snapshot");
                Some(grid)
            }
            Err(e) => {
                warn!(sensor_id, error = %e, "persisted background snapshot shape mismatch, starting cold");
                None
            }
        }
    }

    /// Snapshots the grid and its regions and hands both blobs to the
    /// persistence sink. Called once, right after settling completes.
    fn persist_background_snapshot(&self, now_ns: i64) {
        let snapshot = {
            let grid = self.grid.read();
            match grid.snapshot() {
                Ok(blob) => Some((blob, grid.regions())),
                Err(e) => {
                    warn!(sensor_id = self.sensor_id, error = %e, "failed to snapshot background grid");
                    None
                }
            }
        };
        let Some((blob, regions)) = snapshot else { return };

        self.persistence.put_background_snapshot(self.sensor_id, now_ns, &blob);
        match background::serialize_regions(&regions) {
            Ok(region_blob) => self.persistence.put_region_snapshot(self.sensor_id, now_ns, &region_blob),
            Err(e) => warn!(sensor_id = self.sensor_id, error = %e, "failed to serialize region snapshot"),
        }
    }

    pub fn with_pose(mut self: Arc<Self>, pose: Pose) -> Arc<Self> {
        // `Arc::get_mut` only succeeds before any clone has escaped, which
        // holds here: this is called immediately after `new`.
        if let Some(rt) = Arc::get_mut(&mut self) {
            rt.pose = pose;
        }
        self
    }

    pub fn publisher(&self) -> Arc<PublishBroadcaster> {
        self.publisher.clone()
    }

    pub fn sensor_id(&self) -> u16 {
        self.sensor_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // ---- control surface handler logic (section 6) ----

    pub fn get_params(&self) -> PerceptionParams {
        self.params.read().clone()
    }

    /// Validates and applies a patch atomically, then propagates the
    /// relevant subsets into the grid and tracker under their own locks. A
    /// rejected patch leaves every piece of state untouched.
    pub fn apply_config_patch(&self, patch: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        let mut candidate = self.params.read().clone();
        candidate.apply_patch(patch)?;

        self.grid.write().patch_config(|cfg| *cfg = candidate.background.clone());
        {
            let mut tracker = self.tracker.lock();
            tracker.patch_params(|p| *p = candidate.tracker.clone());
            tracker.patch_cluster_params(|p| *p = candidate.cluster.clone());
        }
        *self.params.write() = candidate;
        Ok(())
    }

    pub fn grid_status(&self) -> GridStatusResponse {
        control::grid_status(&self.grid.read())
    }

    /// Forces an immediate background/region snapshot to persistence,
    /// independent of the automatic snapshot taken on settling completion.
    /// Exposed for a host's own control surface (e.g. an operator-triggered
    /// checkpoint before a planned restart).
    pub fn snapshot_background(&self) {
        self.persist_background_snapshot(now_ns());
    }

    /// Clears background and tracker state and publishes a `ResetEvent`, as
    /// required whenever the background grid is reset.
    pub fn grid_reset(&self) {
        let now = now_ns();
        let background_params = self.params.read().background.clone();
        *self.grid.write() = BackgroundGrid::new(background_params);
        *self.region_manager.lock() = RegionManager::new();
        self.tracker.lock().reset();
        self.publisher.publish_reset(ResetEvent { sensor_id: self.sensor_id, ts_ns: now });
        info!(sensor_id = self.sensor_id, "grid and tracker reset");
    }

    pub fn data_source(&self) -> DataSource {
        self.data_source.current()
    }

    pub fn start_pcap(&self, analysis_mode: bool) {
        self.data_source.start_pcap(analysis_mode);
    }

    pub fn stop_pcap(&self) {
        if self.data_source.stop_pcap() == DataSourceTransition::ResetAndResumeLive {
            self.grid_reset();
        }
    }

    pub fn resume_live(&self) {
        self.data_source.resume_live();
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_throttled(&self) -> u64 {
        self.frames_throttled.load(Ordering::Relaxed)
    }

    /// Runs one frame through B..F, then H and I. Returns early (before
    /// taking any lock) if cancellation was requested, and returns early
    /// (after only touching the tracker) if the frame is throttled.
    pub fn process_frame(&self, frame: Frame) {
        if self.is_cancelled() {
            return;
        }
        let now = frame.wall_clock_ns;

        if self.should_throttle(now) {
            self.frames_throttled.fetch_add(1, Ordering::Relaxed);
            self.tracker.lock().advance_misses(now);
            return;
        }
        *self.last_processed_ns.lock() = Some(now);

        let settled_before = self.grid.read().is_settling_complete();
        let mask = {
            let grid = self.grid.read();
            let mut region_manager = self.region_manager.lock();
            grid.process_frame(&frame.points, now, &mut region_manager)
        };

        if !settled_before && self.grid.read().is_settling_complete() {
            self.persist_background_snapshot(now);
        }

        if self.is_cancelled() {
            return;
        }

        let foreground: Vec<CartesianPoint> = frame
            .points
            .iter()
            .zip(mask.iter())
            .filter(|(_, &is_fg)| is_fg)
            .map(|(p, _)| polar_to_cartesian(p, &self.pose, self.sensor_id))
            .collect();

        let cluster_params = self.params.read().cluster.clone();
        let clusters = cluster_frame(&foreground, &cluster_params);

        if self.is_cancelled() {
            return;
        }

        let observations = {
            let mut tracker = self.tracker.lock();
            let observations = tracker.update(&clusters, now);

            let classifier_params = self.params.read().classifier.clone();
            for (track_id, features) in tracker.confirmed_snapshots() {
                let (class, confidence) = classifier::classify(&features, &classifier_params);
                tracker.update_classification(track_id, class, confidence);
            }
            observations
        };

        if self.is_cancelled() {
            return;
        }

        let summaries = self.tracker.lock().summaries();
        let confirmed: Vec<_> = summaries.iter().filter(|s| s.state == TrackState::Confirmed).cloned().collect();

        let batch = PersistenceBatch {
            sensor_id: self.sensor_id,
            ts_ns: now,
            clusters: clusters.clone(),
            track_summaries: summaries,
            track_observations: observations,
        };
        if !batch.clusters.is_empty() || !batch.track_summaries.is_empty() || !batch.track_observations.is_empty() {
            self.persistence.flush(batch);
        }

        let artifacts = FrameArtifacts {
            sensor_id: self.sensor_id,
            frame_id: frame.frame_id,
            wall_clock_ns: now,
            clusters,
            confirmed_tracks: confirmed,
            foreground_mask: mask,
        };
        self.publisher.publish_frame(&artifacts);

        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn should_throttle(&self, now_ns: i64) -> bool {
        let target_hz = self.params.read().pipeline.target_hz;
        if target_hz <= 0.0 {
            return false;
        }
        let min_period_ns = (1.0e9 / target_hz) as i64;
        match *self.last_processed_ns.lock() {
            Some(prev) => now_ns - prev < min_period_ns,
            None => false,
        }
    }

    /// Once-a-minute (by default) sweep that removes deleted tracks and
    /// their observations older than `deleted_track_ttl_secs`.
    pub fn prune_deleted(&self) {
        let now = now_ns();
        let ttl_secs = self.params.read().pipeline.deleted_track_ttl_secs;
        self.tracker.lock().prune_deleted(now, ttl_secs);
        self.persistence.prune_deleted(self.sensor_id, Duration::from_secs(ttl_secs));
    }
}

/// Bounded, drop-oldest queue feeding the dedicated pipeline worker (G),
/// kept separate from the frame-assembly worker (A) so a slow pipeline
/// stage never backs up frame ingestion.
struct PipelineQueue {
    pending: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify_tx: crossbeam_channel::Sender<()>,
    notify_rx: crossbeam_channel::Receiver<()>,
    dropped: AtomicU64,
}

impl PipelineQueue {
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
            warn!(total_dropped = total, "pipeline worker queue full, dropping oldest frame");
        }
        q.push_back(frame);
        drop(q);
        let _ = self.notify_tx.try_send(());
    }

    fn pop(&self) -> Option<Frame> {
        self.pending.lock().pop_front()
    }
}

/// Owns the worker threads spawned for one sensor: the frame-assembly
/// worker (A), the pipeline worker (G), and the once-a-minute deleted-track
/// pruning sweep. Dropping this stops all three.
pub struct PipelineHandle {
    _frame_worker_guard: FrameBuilderWorkerGuard,
    _stop_tx: crossbeam_channel::Sender<()>,
    _prune_stop_tx: crossbeam_channel::Sender<()>,
}

/// Wires a `SensorRuntime` up to a `FrameBuilder`: frames it finalizes are
/// queued (drop-oldest) to a dedicated pipeline worker thread, which runs
/// `SensorRuntime::process_frame` to completion before picking up the next
/// one. A second thread prunes deleted tracks on `prune_interval_secs`.
pub fn spawn(runtime: Arc<SensorRuntime>, frame_builder: &mut FrameBuilder, queue_capacity: usize, prune_interval_secs: u64) -> PipelineHandle {
    let queue = Arc::new(PipelineQueue::new(queue_capacity));
    let queue_for_subscriber = queue.clone();
    let frame_worker_guard = frame_builder.subscribe(move |frame| queue_for_subscriber.push(frame));

    let pipeline_runtime = runtime.clone();
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
    std::thread::spawn(move || loop {
        crossbeam_channel::select! {
            recv(queue.notify_rx) -> _ => {
                while let Some(frame) = queue.pop() {
                    pipeline_runtime.process_frame(frame);
                }
            }
            recv(stop_rx) -> _ => return,
        }
    });

    let prune_runtime = runtime;
    let (prune_stop_tx, prune_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let tick = crossbeam_channel::tick(Duration::from_secs(prune_interval_secs.max(1)));
    std::thread::spawn(move || loop {
        crossbeam_channel::select! {
            recv(tick) -> _ => prune_runtime.prune_deleted(),
            recv(prune_stop_rx) -> _ => return,
        }
    });

    PipelineHandle { _frame_worker_guard: frame_worker_guard, _stop_tx: stop_tx, _prune_stop_tx: prune_stop_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerceptionParams;
    use crate::persistence::NullSink;
    use crate::types::PolarPoint;

    fn synthetic_frame(frame_id: u64, ts_ns: i64, cx: f64, cy: f64, n: usize) -> Frame {
        let mut points = Vec::new();
        for i in 0..n {
            let angle = (i as f64) / (n as f64) * std::f64::consts::TAU;
            let x = cx + angle.cos() * 0.3;
            let y = cy + angle.sin() * 0.3;
            let distance = (x * x + y * y).sqrt().max(0.01);
            let azimuth = y.atan2(x).to_degrees().rem_euclid(360.0);
            points.push(PolarPoint {
                ring_index: 20,
                azimuth_deg: azimuth,
                elevation_deg: 0.0,
                distance_m: distance,
                intensity: 50,
                timestamp_ns: ts_ns,
            });
        }
        Frame { frame_id, wall_clock_ns: ts_ns, points }
    }

    fn settled_runtime() -> Arc<SensorRuntime> {
        let mut params = PerceptionParams::default();
        params.background.warmup_min_frames = 0;
        params.background.warmup_duration_nanos = 0;
        params.pipeline.target_hz = 1000.0;
        SensorRuntime::new(0, params, Arc::new(NullSink))
    }

    /// Records the latest snapshot blobs put to it, so a test can both
    /// observe that the orchestrator wrote one and feed it back in as the
    /// seed for a second runtime.
    #[derive(Default)]
    struct SnapshotRecordingSink {
        background: Mutex<Option<Vec<u8>>>,
        region: Mutex<Option<Vec<u8>>>,
    }

    impl PersistenceSink for SnapshotRecordingSink {
        fn insert_cluster(&self, _sensor_id: u16, _ts_ns: i64, _cluster: &crate::types::Cluster) -> std::result::Result<(), String> {
            Ok(())
        }
        fn insert_track(&self, _summary: &crate::types::TrackSummary) -> std::result::Result<(), String> {
            Ok(())
        }
        fn insert_track_observation(&self, _obs: &crate::types::TrackObservation) -> std::result::Result<(), String> {
            Ok(())
        }
        fn prune_deleted_tracks(&self, _sensor_id: u16, _ttl: Duration) -> std::result::Result<u64, String> {
            Ok(0)
        }
        fn put_background_snapshot(&self, _sensor_id: u16, _ts_ns: i64, blob: &[u8]) -> std::result::Result<(), String> {
            *self.background.lock() = Some(blob.to_vec());
            Ok(())
        }
        fn get_latest_background_snapshot(&self, _sensor_id: u16) -> std::result::Result<Option<Vec<u8>>, String> {
            Ok(self.background.lock().clone())
        }
        fn put_region_snapshot(&self, _sensor_id: u16, _ts_ns: i64, blob: &[u8]) -> std::result::Result<(), String> {
            *self.region.lock() = Some(blob.to_vec());
            Ok(())
        }
        fn get_latest_region_snapshot(&self, _sensor_id: u16) -> std::result::Result<Option<Vec<u8>>, String> {
            Ok(self.region.lock().clone())
        }
    }

    #[test]
    fn empty_frame_increments_misses_without_clusters() {
        let rt = settled_runtime();
        rt.process_frame(synthetic_frame(0, 0, 0.0, 0.0, 30));
        rt.process_frame(Frame { frame_id: 1, wall_clock_ns: 100_000_000, points: vec![] });
        assert_eq!(rt.frames_processed(), 2);
    }

    #[test]
    fn throttled_frame_only_advances_misses() {
        let rt = settled_runtime();
        {
            let mut p = rt.params.write();
            p.pipeline.target_hz = 1.0; // 1 second min period
        }
        rt.process_frame(synthetic_frame(0, 0, 0.0, 0.0, 30));
        rt.process_frame(synthetic_frame(1, 10_000_000, 0.0, 0.0, 30));
        assert_eq!(rt.frames_processed(), 1);
        assert_eq!(rt.frames_throttled(), 1);
    }

    #[test]
    fn grid_reset_clears_tracks_and_publishes_event() {
        let rt = settled_runtime();
        rt.process_frame(synthetic_frame(0, 0, 0.0, 0.0, 30));
        rt.grid_reset();
        assert_eq!(rt.tracker.lock().track_count(), 0);
    }

    #[test]
    fn config_patch_propagates_to_grid_and_tracker() {
        let rt = settled_runtime();
        let mut patch = BTreeMap::new();
        patch.insert("gating_distance_squared".to_string(), serde_json::json!(9.0));
        rt.apply_config_patch(&patch).unwrap();
        assert_eq!(rt.get_params().tracker.gating_distance_squared, 9.0);
    }

    #[test]
    fn rejected_patch_leaves_params_untouched() {
        let rt = settled_runtime();
        let before = rt.get_params();
        let mut patch = BTreeMap::new();
        patch.insert("not_a_key".to_string(), serde_json::json!(1));
        assert!(rt.apply_config_patch(&patch).is_err());
        assert_eq!(rt.get_params(), before);
    }

    #[test]
    fn settling_completion_persists_a_snapshot_a_second_runtime_can_restore() {
        let mut params = PerceptionParams::default();
        params.background.warmup_min_frames = 0;
        params.background.warmup_duration_nanos = 0;
        params.pipeline.target_hz = 1000.0;

        let sink = Arc::new(SnapshotRecordingSink::default());
        let rt = SensorRuntime::new(0, params.clone(), sink.clone());
        rt.process_frame(synthetic_frame(0, 0, 0.0, 0.0, 30));
        assert!(rt.grid.read().is_settling_complete());
        assert!(sink.background.lock().is_some(), "settling completion should have persisted a background snapshot");
        assert!(sink.region.lock().is_some(), "settling completion should have persisted a region snapshot");

        // A fresh runtime constructed against the same sink should come up
        // already settled instead of needing to re-warm.
        let restarted = SensorRuntime::new(0, params, sink);
        assert!(restarted.grid.read().is_settling_complete());
    }

    #[test]
    fn snapshot_background_persists_on_demand() {
        let sink = Arc::new(SnapshotRecordingSink::default());
        let rt = SensorRuntime::new(0, PerceptionParams::default(), sink.clone());
        rt.snapshot_background();
        assert!(sink.background.lock().is_some());
        assert!(sink.region.lock().is_some());
    }
}
