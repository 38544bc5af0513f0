//! L.H: the narrow interface contract the core requires from a relational
//! store. Storage mechanics (SQLite, schema migrations, connection pooling)
//! are an external collaborator's problem; this module only defines what
//! the pipeline calls and how it batches and bounds those calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::PipelineParams;
use crate::types::{Cluster, TrackObservation, TrackSummary};

/// Operations the core consumes from a relational store. Implementations
/// live outside this crate; tests and examples use [`NullSink`] or an
/// in-memory recorder.
///
/// `insert_track_observation` is contracted to only ever be called with a
/// real, matched-this-frame observation (see [`crate::types::TrackObservation`]
/// and the tracker's `misses == 0` invariant) — an implementation is free
/// to treat a violation as a bug, not a recoverable error.
pub trait PersistenceSink: Send + Sync {
    fn insert_cluster(&self, sensor_id: u16, ts_ns: i64, cluster: &Cluster) -> Result<(), String>;
    /// Idempotent upsert by `track_id`.
    fn insert_track(&self, summary: &TrackSummary) -> Result<(), String>;
    fn insert_track_observation(&self, obs: &TrackObservation) -> Result<(), String>;
    fn prune_deleted_tracks(&self, sensor_id: u16, ttl: Duration) -> Result<u64, String>;
    fn put_background_snapshot(&self, sensor_id: u16, ts_ns: i64, blob: &[u8]) -> Result<(), String>;
    fn get_latest_background_snapshot(&self, sensor_id: u16) -> Result<Option<Vec<u8>>, String>;
    fn put_region_snapshot(&self, sensor_id: u16, ts_ns: i64, blob: &[u8]) -> Result<(), String>;
    fn get_latest_region_snapshot(&self, sensor_id: u16) -> Result<Option<Vec<u8>>, String>;
}

/// Discards everything; used where no store is configured yet (e.g. a
/// sweep/tuning run that only cares about the live publish stream).
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn insert_cluster(&self, _sensor_id: u16, _ts_ns: i64, _cluster: &Cluster) -> Result<(), String> {
        Ok(())
    }
    fn insert_track(&self, _summary: &TrackSummary) -> Result<(), String> {
        Ok(())
    }
    fn insert_track_observation(&self, _obs: &TrackObservation) -> Result<(), String> {
        Ok(())
    }
    fn prune_deleted_tracks(&self, _sensor_id: u16, _ttl: Duration) -> Result<u64, String> {
        Ok(0)
    }
    fn put_background_snapshot(&self, _sensor_id: u16, _ts_ns: i64, _blob: &[u8]) -> Result<(), String> {
        Ok(())
    }
    fn get_latest_background_snapshot(&self, _sensor_id: u16) -> Result<Option<Vec<u8>>, String> {
        Ok(None)
    }
    fn put_region_snapshot(&self, _sensor_id: u16, _ts_ns: i64, _blob: &[u8]) -> Result<(), String> {
        Ok(())
    }
    fn get_latest_region_snapshot(&self, _sensor_id: u16) -> Result<Option<Vec<u8>>, String> {
        Ok(None)
    }
}

/// Everything one frame needs persisted, batched so the pipeline issues a
/// single logical write per frame instead of one round trip per row.
#[derive(Debug, Default, Clone)]
pub struct PersistenceBatch {
    pub sensor_id: u16,
    pub ts_ns: i64,
    pub clusters: Vec<Cluster>,
    pub track_summaries: Vec<TrackSummary>,
    pub track_observations: Vec<TrackObservation>,
}

/// Named counters surfaced on the status endpoint; failures never block the
/// pipeline, they just increment one of these.
#[derive(Debug, Default)]
pub struct PersistenceCounters {
    pub batches_flushed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batches_timed_out: AtomicU64,
    pub rows_dropped: AtomicU64,
}

impl PersistenceCounters {
    pub fn snapshot(&self) -> PersistenceCountersSnapshot {
        PersistenceCountersSnapshot {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_timed_out: self.batches_timed_out.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceCountersSnapshot {
    pub batches_flushed: u64,
    pub batches_failed: u64,
    pub batches_timed_out: u64,
    pub rows_dropped: u64,
}

/// Flushes a batch against a sink, enforcing `PersistBatchTimeout` by
/// racing the write against a timer on a scratch thread. A blocked or slow
/// sink counts as a failed batch rather than wedging the pipeline worker.
pub struct PersistenceWriter {
    sink: Arc<dyn PersistenceSink>,
    timeout: Duration,
    counters: Arc<PersistenceCounters>,
}

impl PersistenceWriter {
    pub fn new(sink: Arc<dyn PersistenceSink>, params: &PipelineParams) -> Self {
        Self {
            sink,
            timeout: Duration::from_millis(params.persist_batch_timeout_ms),
            counters: Arc::new(PersistenceCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<PersistenceCounters> {
        self.counters.clone()
    }

    pub fn flush(&self, batch: PersistenceBatch) {
        let sink = self.sink.clone();
        let counters = self.counters.clone();
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);

        std::thread::spawn(move || {
            write_batch(sink.as_ref(), &batch, &counters);
            let _ = tx.send(());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(()) => {}
            Err(_) => {
                self.counters.batches_timed_out.fetch_add(1, Ordering::Relaxed);
                warn!("persistence batch exceeded PersistBatchTimeout, counted and dropped");
            }
        }
    }

    pub fn prune_deleted(&self, sensor_id: u16, ttl: Duration) {
        match self.sink.prune_deleted_tracks(sensor_id, ttl) {
            Ok(_) => {}
            Err(e) => {
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "prune_deleted_tracks failed");
            }
        }
    }

    pub fn put_background_snapshot(&self, sensor_id: u16, ts_ns: i64, blob: &[u8]) {
        if let Err(e) = self.sink.put_background_snapshot(sensor_id, ts_ns, blob) {
            self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "put_background_snapshot failed");
        }
    }

    pub fn put_region_snapshot(&self, sensor_id: u16, ts_ns: i64, blob: &[u8]) {
        if let Err(e) = self.sink.put_region_snapshot(sensor_id, ts_ns, blob) {
            self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "put_region_snapshot failed");
        }
    }

    pub fn get_latest_background_snapshot(&self, sensor_id: u16) -> Option<Vec<u8>> {
        match self.sink.get_latest_background_snapshot(sensor_id) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "get_latest_background_snapshot failed");
                None
            }
        }
    }

    pub fn get_latest_region_snapshot(&self, sensor_id: u16) -> Option<Vec<u8>> {
        match self.sink.get_latest_region_snapshot(sensor_id) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "get_latest_region_snapshot failed");
                None
            }
        }
    }
}

fn write_batch(sink: &dyn PersistenceSink, batch: &PersistenceBatch, counters: &PersistenceCounters) {
    let mut any_failed = false;

    for cluster in &batch.clusters {
        if sink.insert_cluster(batch.sensor_id, batch.ts_ns, cluster).is_err() {
            any_failed = true;
            counters.rows_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
    for summary in &batch.track_summaries {
        if sink.insert_track(summary).is_err() {
            any_failed = true;
            counters.rows_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
    for obs in &batch.track_observations {
        if sink.insert_track_observation(obs).is_err() {
            any_failed = true;
            counters.rows_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    if any_failed {
        counters.batches_failed.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }
}
