//! Handler logic for the HTTP-style control surface described in section 6
//! of the design: parameter patches, grid status, and data-source
//! switching. The actual HTTP framing lives in the surrounding host; this
//! module is the part the core is responsible for.

use hdrhistogram::Histogram;

use crate::background::BackgroundGrid;

/// `GET grid_status` response body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridStatusResponse {
    pub settling_complete: bool,
    pub region_count: usize,
    pub times_seen_p50: u64,
    pub times_seen_p95: u64,
    pub times_seen_max: u64,
}

pub fn grid_status(grid: &BackgroundGrid) -> GridStatusResponse {
    let mut hist = Histogram::<u64>::new(3).expect("fixed sigfigs is always valid");
    for (times_seen, count) in grid.times_seen_histogram() {
        let _ = hist.record_n(times_seen as u64, count as u64);
    }
    GridStatusResponse {
        settling_complete: grid.is_settling_complete(),
        region_count: grid.region_count(),
        times_seen_p50: hist.value_at_quantile(0.50),
        times_seen_p95: hist.value_at_quantile(0.95),
        times_seen_max: hist.max(),
    }
}

/// State machine backing `GET data_source` / `POST pcap/start` /
/// `POST pcap/stop` / `POST resume_live`.
///
/// `pcap/start` with `analysis_mode == true` preserves the background grid
/// across the replay so results can be inspected afterwards; without it,
/// `pcap/stop` resets the grid and resumes live classification from
/// scratch, matching a normal sensor power-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Live,
    PcapReplay { analysis_mode: bool },
}

impl Default for DataSource {
    fn default() -> Self {
        DataSource::Live
    }
}

/// Outcome of a data-source transition the orchestrator must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceTransition {
    /// No side effect beyond the state change.
    None,
    /// `pcap/stop` without `analysis_mode`: reset grid + tracker, resume live.
    ResetAndResumeLive,
}

#[derive(Debug, Default)]
pub struct DataSourceController {
    current: parking_lot::Mutex<DataSource>,
}

impl DataSourceController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> DataSource {
        *self.current.lock()
    }

    pub fn start_pcap(&self, analysis_mode: bool) {
        *self.current.lock() = DataSource::PcapReplay { analysis_mode };
    }

    /// Ends pcap replay. Returns the transition the orchestrator must
    /// apply: analysis-mode replays leave the grid untouched, everything
    /// else resets and resumes live.
    pub fn stop_pcap(&self) -> DataSourceTransition {
        let mut current = self.current.lock();
        let was_analysis = matches!(*current, DataSource::PcapReplay { analysis_mode: true });
        *current = DataSource::Live;
        if was_analysis {
            DataSourceTransition::None
        } else {
            DataSourceTransition::ResetAndResumeLive
        }
    }

    pub fn resume_live(&self) {
        *self.current.lock() = DataSource::Live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_mode_replay_preserves_grid_on_stop() {
        let ctrl = DataSourceController::new();
        ctrl.start_pcap(true);
        assert_eq!(ctrl.stop_pcap(), DataSourceTransition::None);
        assert_eq!(ctrl.current(), DataSource::Live);
    }

    #[test]
    fn plain_replay_resets_grid_on_stop() {
        let ctrl = DataSourceController::new();
        ctrl.start_pcap(false);
        assert_eq!(ctrl.stop_pcap(), DataSourceTransition::ResetAndResumeLive);
    }
}
