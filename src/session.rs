//! Classification sessions.
//!
//! A [`Session`] ties the pipeline stages together. Poses enter through a [`Producer`], which
//! normalizes them and appends them to the shared [`SkeletonBuffer`]. While the session is
//! running, a [`SamplingScheduler`] periodically drains the buffer, samples and assembles the
//! frames into a tensor, classifies it, and hands the resulting [`DisplayLabel`] to the label sink.
//!
//! The label sink runs on its own [`Worker`] thread, so a slow consumer never delays a tick. If
//! the sink falls behind, new labels are dropped.

use std::sync::Arc;

use anyhow::{bail, Context};

use crate::{
    assemble::TensorLayout,
    buffer::SkeletonBuffer,
    classifier::ActionClassifier,
    config::PipelineConfig,
    landmark::{Frame, Pose},
    normalize::LandmarkNormalizer,
    postprocess::{DisplayLabel, LabelState, ScorePostprocessor},
    scheduler::{SamplingScheduler, Tick},
    timer::{FpsCounter, Timer},
    worker::Worker,
};

/// A running or stopped classification session.
pub struct Session {
    config: PipelineConfig,
    buffer: Arc<SkeletonBuffer>,
    /// Present while the session is stopped.
    state: Option<TickState>,
    /// Present while the session is running.
    scheduler: Option<SamplingScheduler<TickState>>,
}

impl Session {
    /// Creates a stopped session.
    ///
    /// `classifier` is invoked once per tick; `sink` receives every label produced by a tick, on a
    /// dedicated thread.
    ///
    /// Returns an error if `config` is invalid or the label sink thread could not be spawned.
    pub fn new<C, S>(config: PipelineConfig, classifier: C, sink: S) -> anyhow::Result<Self>
    where
        C: ActionClassifier + 'static,
        S: FnMut(DisplayLabel) + Send + 'static,
    {
        config.validate()?;

        let publisher = Worker::builder()
            .name("label sink")
            .capacity(config.label_queue())
            .spawn(sink)
            .context("failed to spawn label sink thread")?;

        let buffer = Arc::new(SkeletonBuffer::new());
        let state = TickState {
            buffer: buffer.clone(),
            classifier: Box::new(classifier),
            postprocessor: ScorePostprocessor::new(config.other_label()),
            publisher,
            window_length: config.window_length(),
            layout: config.layout(),
            wait_for_landmarks: config.wait_for_landmarks(),
            t_assemble: Timer::new("assemble"),
            t_infer: Timer::new("infer"),
            t_postprocess: Timer::new("postprocess"),
        };

        Ok(Self {
            config,
            buffer,
            state: Some(state),
            scheduler: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Creates a [`Producer`] that feeds poses into this session.
    ///
    /// Every producer has its own [`LandmarkNormalizer`]. Sessions are meant to be fed by a single
    /// pose pipeline; frames of multiple producers are interleaved in arrival order.
    pub fn producer(&self) -> Producer {
        Producer {
            normalizer: LandmarkNormalizer::new(self.config.normalization()),
            buffer: self.buffer.clone(),
            fps: FpsCounter::new("landmarks"),
        }
    }

    /// Returns the number of frames that were appended since the last tick.
    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether ticks are being scheduled.
    ///
    /// This returns `false` once a tick has panicked. The panic is propagated by the next call to
    /// [`Session::start`] or [`Session::stop`].
    pub fn is_running(&self) -> bool {
        self.scheduler
            .as_ref()
            .map_or(false, SamplingScheduler::is_running)
    }

    /// Starts periodic classification. The first tick runs immediately.
    ///
    /// Does nothing if the session is already running. If the classification thread cannot be
    /// spawned, an error is returned and the session stays stopped with its state intact.
    ///
    /// If a previous tick has panicked, this will propagate the panic to the calling thread.
    pub fn start(&mut self) -> anyhow::Result<()> {
        match &self.scheduler {
            Some(scheduler) if scheduler.is_running() => return Ok(()),
            Some(_) => self.stop(),
            None => {}
        }
        let Some(state) = self.state.take() else {
            bail!("session state was lost, the session has to be recreated");
        };

        let spawned = SamplingScheduler::builder()
            .name("classification")
            .period(self.config.period())
            .overlap(self.config.overlap())
            .spawn(state, TickState::tick);
        let scheduler = match spawned {
            Ok(scheduler) => scheduler,
            Err(err) => {
                let (state, error) = err.into_parts();
                self.state = Some(state);
                return Err(error).context("failed to spawn classification thread");
            }
        };
        self.scheduler = Some(scheduler);
        log::debug!("session started");
        Ok(())
    }

    /// Stops periodic classification.
    ///
    /// A tick that is currently running is allowed to finish. The label smoothing state is kept,
    /// so a restarted session continues where it left off.
    ///
    /// If a tick has panicked, this will propagate the panic to the calling thread.
    pub fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            self.state = Some(scheduler.stop());
            log::debug!("session stopped");
        }
    }

    /// Returns the label smoothing state, or [`None`] while the session is running.
    pub fn label_state(&self) -> Option<LabelState> {
        self.state.as_ref().map(|s| s.postprocessor.state())
    }
}

/// Feeds detected poses into a [`Session`].
///
/// This is meant to be called from the pose detection thread, at camera rate. Appending never
/// waits for a running classification tick.
pub struct Producer {
    normalizer: LandmarkNormalizer,
    buffer: Arc<SkeletonBuffer>,
    fps: FpsCounter,
}

impl Producer {
    /// Normalizes `pose` and appends it to the session's buffer.
    ///
    /// `orientation_degrees` is the rotation of the device, as reported by the platform.
    pub fn push_pose(&mut self, pose: &Pose, orientation_degrees: i32) {
        let frame = self.normalizer.normalize(pose, orientation_degrees);
        self.push_frame(frame);
    }

    /// Appends an already normalized frame.
    pub fn push_frame(&mut self, frame: Frame) {
        self.buffer.append(frame);
        self.fps
            .tick_with(format_args!("anchor {:?}", self.normalizer.anchor()));
    }

    /// Updates the screen size used for screen-space normalization.
    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        self.normalizer.set_screen_size(width, height);
    }

    pub fn normalizer(&self) -> &LandmarkNormalizer {
        &self.normalizer
    }
}

/// Everything a tick needs. Owned by the scheduler thread while the session runs.
struct TickState {
    buffer: Arc<SkeletonBuffer>,
    classifier: Box<dyn ActionClassifier>,
    postprocessor: ScorePostprocessor,
    publisher: Worker<DisplayLabel>,
    window_length: usize,
    layout: TensorLayout,
    wait_for_landmarks: bool,
    t_assemble: Timer,
    t_infer: Timer,
    t_postprocess: Timer,
}

impl TickState {
    fn tick(&mut self, tick: Tick) {
        log::trace!(
            "tick {} ({:?} since previous), {} frames buffered",
            tick.index(),
            tick.since_previous(),
            self.buffer.len(),
        );
        if self.wait_for_landmarks && !self.buffer.has_received_frames() {
            log::trace!("no landmarks received yet, skipping tick");
            return;
        }

        let seq = self.buffer.drain_and_sample(self.window_length);
        let tensor = self.t_assemble.time(|| self.layout.assemble(&seq));
        let label = match self.t_infer.time(|| self.classifier.infer(&tensor)) {
            Ok(scores) => {
                log::trace!("classifier scores: {scores:?}");
                self.t_postprocess
                    .time(|| self.postprocessor.classify(&scores))
            }
            Err(e) => {
                log::error!("action classification failed: {e:#}");
                DisplayLabel::empty()
            }
        };
        log::debug!("{}, {}, {}", self.t_assemble, self.t_infer, self.t_postprocess);

        log::trace!("publishing label '{label}'");
        if let Err(label) = self.publisher.try_send(label) {
            log::warn!("label sink is busy, dropping label '{label}'");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        time::Duration,
    };

    use crossbeam::channel;

    use super::*;
    use crate::{nn::tensor::Tensor, normalize::Normalization};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn zero_scores(_: &Tensor) -> anyhow::Result<Vec<f32>> {
        Ok(vec![0.0; 19])
    }

    fn idle_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_period(Duration::from_secs(3600))
            .with_label_queue(16)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PipelineConfig::default().with_window_length(100);
        let res = Session::new(config, zero_scores, |_| {});
        assert!(res.is_err());
    }

    #[test]
    fn first_tick_publishes_empty_label() {
        let (sender, recv) = channel::unbounded();
        let mut session = Session::new(
            idle_config(),
            zero_scores,
            move |label| sender.send(label).unwrap(),
        )
        .unwrap();
        assert!(!session.is_running());
        assert!(session.label_state().is_some());

        session.start().unwrap();
        assert!(session.is_running());
        assert!(session.label_state().is_none());
        let label = recv.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(label.text(), "");

        session.stop();
        assert!(!session.is_running());
        assert_eq!(session.label_state(), Some(LabelState::default()));
    }

    #[test]
    fn inference_error_keeps_state() {
        let (sender, recv) = channel::unbounded();
        let mut session = Session::new(
            idle_config(),
            |_: &Tensor| -> anyhow::Result<Vec<f32>> { bail!("backend unavailable") },
            move |label| sender.send(label).unwrap(),
        )
        .unwrap();

        session.start().unwrap();
        assert_eq!(recv.recv_timeout(TIMEOUT).unwrap(), DisplayLabel::empty());
        session.stop();
        assert_eq!(session.label_state(), Some(LabelState::default()));
    }

    #[test]
    fn waits_for_landmarks() {
        let (sender, recv) = channel::unbounded();
        let mut session = Session::new(
            idle_config()
                .with_wait_for_landmarks(true)
                .with_period(Duration::from_millis(5)),
            zero_scores,
            move |label| sender.send(label).unwrap(),
        )
        .unwrap();

        session.start().unwrap();
        assert!(recv.recv_timeout(Duration::from_millis(100)).is_err());

        session.producer().push_frame(Frame::default());
        recv.recv_timeout(TIMEOUT).unwrap();
    }

    #[test]
    fn tick_panic_stops_session() {
        let mut session = Session::new(
            idle_config(),
            |_: &Tensor| -> anyhow::Result<Vec<f32>> {
                std::panic::resume_unwind(Box::new("classifier panic"))
            },
            |_| {},
        )
        .unwrap();

        session.start().unwrap();
        let deadline = std::time::Instant::now() + TIMEOUT;
        while session.is_running() {
            assert!(std::time::Instant::now() < deadline, "tick did not panic");
            std::thread::yield_now();
        }
        assert!(session.label_state().is_none());

        let res = catch_unwind(AssertUnwindSafe(|| session.start()));
        assert!(res.is_err());
        assert!(!session.is_running());
        // The state went down with the panicking tick.
        assert!(session.start().is_err());
    }

    #[test]
    fn producer_normalizes() {
        let session = Session::new(
            idle_config().with_normalization(Normalization::ScreenExtent {
                width: 100,
                height: 100,
            }),
            zero_scores,
            |_| {},
        )
        .unwrap();

        let mut producer = session.producer();
        producer.set_screen_size(0, 0);
        assert_eq!(
            producer.normalizer().policy(),
            Normalization::ScreenExtent {
                width: 100,
                height: 100
            }
        );

        let pose = Pose::from_landmarks(
            (0..25).map(|_| crate::landmark::Landmark::new([1.0, 1.0, 1.0])),
        )
        .unwrap();
        producer.push_pose(&pose, 0);
        producer.push_pose(&pose, 90);
        assert_eq!(session.buffered_frames(), 2);
    }
}
