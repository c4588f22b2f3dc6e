//! Skeleton-based action recognition.
//!
//! Classifies what a person in front of a camera is doing (painting, being interviewed, or
//! something else) from the body landmarks a pose detector reports for each camera frame.
//!
//! # Pipeline
//!
//! 1. Every detected [`Pose`] is turned into a translation- and scale-invariant [`Frame`] by a
//!    [`LandmarkNormalizer`] and appended to a [`SkeletonBuffer`].
//! 2. Periodically, the buffered frames are drained and resampled to a fixed number of frames.
//! 3. The frames are arranged into a `[1, 3, T, 25, P]` tensor and classified by an
//!    [`ActionClassifier`].
//! 4. The classifier scores are reduced to three activities and smoothed into a [`DisplayLabel`].
//!
//! A [`Session`] runs all of this, and is configured with a [`PipelineConfig`].
//!
//! # Coordinates
//!
//! Landmark coordinates are used as reported by the pose detector. For image-space landmarks, this
//! means that X points to the right and Y points *down*.
//!
//! # Environment Variables
//!
//! Some defaults of [`PipelineConfig`] can be overridden by setting environment variables:
//!
//! * `SKELAR_TICK_PERIOD_MS`: the classification period in milliseconds (default: 4000).
//! * `SKELAR_OVERLAP`: what to do when a classification tick takes longer than the period. `skip`
//!   (the default) skips the missed ticks, `queue` runs them back to back.
//!
//! Invalid values are logged and ignored.
//!
//! [`Pose`]: landmark::Pose
//! [`Frame`]: landmark::Frame
//! [`LandmarkNormalizer`]: normalize::LandmarkNormalizer
//! [`SkeletonBuffer`]: buffer::SkeletonBuffer
//! [`ActionClassifier`]: classifier::ActionClassifier
//! [`DisplayLabel`]: postprocess::DisplayLabel
//! [`Session`]: session::Session
//! [`PipelineConfig`]: config::PipelineConfig

use log::LevelFilter;

pub mod assemble;
pub mod buffer;
pub mod classifier;
pub mod config;
pub mod landmark;
pub mod nn;
pub mod normalize;
pub mod postprocess;
pub mod scheduler;
pub mod session;
pub mod timer;
pub mod worker;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .filter(Some("tract_hir"), LevelFilter::Warn)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and skelar will log at *trace* level.
/// Otherwise, they will log at *debug* level.
///
/// `tract` will always log at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
