//! Error taxonomy for the perception pipeline.
//!
//! Per-point and per-frame failures are counted by the orchestrator rather
//! than propagated as `Err` up through the stack; only conditions that make
//! it impossible to continue (bad configuration, startup failures) are
//! returned as [`Error`] from the public API.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },

    #[error("{source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },

    #[error("{source}")]
    TomlSer {
        #[from]
        source: toml::ser::Error,
    },

    #[error("background grid shape mismatch: expected {expected_rings}x{expected_azimuth}, snapshot has {got_rings}x{got_azimuth}")]
    SnapshotShapeMismatch {
        expected_rings: usize,
        expected_azimuth: usize,
        got_rings: usize,
        got_azimuth: usize,
    },

    #[error("configuration patch rejected, unsupported keys: {0:?}")]
    UnsupportedConfigKeys(Vec<String>),

    #[error("persistence operation failed: {0}")]
    Persistence(String),

    #[error("innovation covariance is singular")]
    SingularKalman,

    #[error("track state contains NaN/Inf: {0}")]
    TrackCorruption(String),
}

pub type Result<T> = std::result::Result<T, Error>;
