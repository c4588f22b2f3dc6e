//! Pipeline configuration.
//!
//! The deployed classifier models differ in how their input skeletons were prepared: how many
//! frames were sampled, how many person slots the tensor has, and how coordinates were scaled. A
//! [`PipelineConfig`] captures one such combination. Presets exist for the known models.

use std::{
    env::{self, VarError},
    sync::OnceLock,
    time::Duration,
};

use anyhow::bail;

use crate::{
    assemble::TensorLayout,
    normalize::Normalization,
    postprocess::OtherLabel,
    scheduler::{OverlapPolicy, DEFAULT_PERIOD},
};

/// Configuration of a classification [`Session`].
///
/// [`Session`]: crate::session::Session
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    window_length: usize,
    layout: TensorLayout,
    normalization: Normalization,
    other_label: OtherLabel,
    period: Duration,
    overlap: OverlapPolicy,
    wait_for_landmarks: bool,
    label_queue: usize,
}

impl Default for PipelineConfig {
    /// Anchor-normalized skeletons, 40 sampled frames in a `[1, 3, 50, 25, 1]` tensor.
    fn default() -> Self {
        let env = env_overrides();
        Self {
            window_length: 40,
            layout: TensorLayout::SINGLE_PERSON_50,
            normalization: Normalization::default(),
            other_label: OtherLabel::Hidden,
            period: env.period.unwrap_or(DEFAULT_PERIOD),
            overlap: env.overlap.unwrap_or_default(),
            wait_for_landmarks: false,
            label_queue: 1,
        }
    }
}

impl PipelineConfig {
    /// Skeletons normalized by the size of the camera preview.
    pub fn screen_space(width: u32, height: u32) -> Self {
        Self::default().with_normalization(Normalization::ScreenExtent { width, height })
    }

    /// World landmarks, used without further scaling.
    pub fn world_landmarks() -> Self {
        Self::default().with_normalization(Normalization::Passthrough)
    }

    /// 60 sampled frames in a two-person `[1, 3, 144, 25, 2]` tensor.
    ///
    /// Classification only starts once the first pose has been received.
    pub fn two_person() -> Self {
        Self::default()
            .with_window_length(60)
            .with_layout(TensorLayout::TWO_PERSON_144)
            .with_wait_for_landmarks(true)
    }

    /// Sets the number of frames sampled from each window.
    ///
    /// Must not exceed the time axis of the [`TensorLayout`]; the remaining time steps are zero.
    #[inline]
    pub fn with_window_length(self, window_length: usize) -> Self {
        Self {
            window_length,
            ..self
        }
    }

    /// Sets the tensor layout the classifier expects.
    #[inline]
    pub fn with_layout(self, layout: TensorLayout) -> Self {
        Self { layout, ..self }
    }

    #[inline]
    pub fn with_normalization(self, normalization: Normalization) -> Self {
        Self {
            normalization,
            ..self
        }
    }

    /// Selects whether the "other" activity is displayed as `Other` or as an empty label.
    #[inline]
    pub fn with_other_label(self, other_label: OtherLabel) -> Self {
        Self {
            other_label,
            ..self
        }
    }

    /// Sets the classification period.
    ///
    /// Overrides the `SKELAR_TICK_PERIOD_MS` environment variable.
    #[inline]
    pub fn with_period(self, period: Duration) -> Self {
        Self { period, ..self }
    }

    /// Overrides the `SKELAR_OVERLAP` environment variable.
    #[inline]
    pub fn with_overlap(self, overlap: OverlapPolicy) -> Self {
        Self { overlap, ..self }
    }

    /// If `true`, ticks are skipped until the first frame has been appended.
    #[inline]
    pub fn with_wait_for_landmarks(self, wait: bool) -> Self {
        Self {
            wait_for_landmarks: wait,
            ..self
        }
    }

    /// Sets how many labels may wait for the label sink before new ones are dropped.
    #[inline]
    pub fn with_label_queue(self, capacity: usize) -> Self {
        Self {
            label_queue: capacity,
            ..self
        }
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn other_label(&self) -> OtherLabel {
        self.other_label
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    pub fn wait_for_landmarks(&self) -> bool {
        self.wait_for_landmarks
    }

    pub fn label_queue(&self) -> usize {
        self.label_queue
    }

    /// Checks that the configured values are consistent with each other.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_length == 0 {
            bail!("window length must be at least 1");
        }
        if self.window_length > self.layout.frames() {
            bail!(
                "window length {} exceeds the {} frames of tensor layout {:?}",
                self.window_length,
                self.layout.frames(),
                self.layout.shape(),
            );
        }
        if self.period.is_zero() {
            bail!("classification period must not be zero");
        }
        if let Normalization::ScreenExtent { width, height } = self.normalization {
            if width < 2 || height < 2 {
                bail!("invalid screen size {width}x{height}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EnvOverrides {
    period: Option<Duration>,
    overlap: Option<OverlapPolicy>,
}

static ENV_OVERRIDES: OnceLock<EnvOverrides> = OnceLock::new();

fn env_overrides() -> &'static EnvOverrides {
    ENV_OVERRIDES.get_or_init(|| {
        let overrides = EnvOverrides {
            period: read_var("SKELAR_TICK_PERIOD_MS", parse_period),
            overlap: read_var("SKELAR_OVERLAP", parse_overlap),
        };
        log::debug!("environment overrides: {overrides:?}");
        overrides
    })
}

fn read_var<T>(name: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    match env::var(name).as_deref() {
        Ok(value) => {
            let parsed = parse(value);
            if parsed.is_none() {
                log::warn!("invalid value set for `{name}` variable: '{value}'; ignoring");
            }
            parsed
        }
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(s)) => {
            log::warn!(
                "invalid value set for `{name}` variable: {}; ignoring",
                s.to_string_lossy()
            );
            None
        }
    }
}

fn parse_period(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

fn parse_overlap(value: &str) -> Option<OverlapPolicy> {
    match value.trim() {
        "skip" => Some(OverlapPolicy::Skip),
        "queue" => Some(OverlapPolicy::Queue),
        _ => None,
    }
}
