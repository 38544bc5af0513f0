//! Real-time background/foreground separation, clustering, and multi-object
//! tracking for a fixed-mount Hesai Pandar40P traffic sensor.
//!
//! A [`pipeline::SensorRuntime`] owns one sensor's worth of state and is the
//! intended entry point for a host process: construct it with a
//! [`persistence::PersistenceSink`], subscribe [`publish::PublishSink`]s to
//! its [`publish::PublishBroadcaster`], then call [`pipeline::spawn`] with a
//! running [`frame_builder::FrameBuilder`] to start the worker threads.

pub mod background;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod control;
pub mod error;
pub mod frame_builder;
pub mod geometry;
pub mod persistence;
pub mod pipeline;
pub mod publish;
pub mod tracker;
pub mod types;

pub use config::{BackgroundParams, ClassifierParams, ClusterParams, PerceptionParams, PipelineParams, TrackerParams};
pub use error::{Error, Result};
pub use pipeline::{PipelineHandle, SensorRuntime};

/// Re-exported so a host binary embedding this pipeline can call
/// `pandar_perception::env_tracing_logger::init()` without adding the
/// logging-setup crate as a dependency of its own.
pub use env_tracing_logger;
