//! Skeleton frame buffering and temporal resampling.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
};

use crate::landmark::Frame;

/// Collects normalized [`Frame`]s between two classification ticks.
///
/// The pose pipeline [`append`]s frames at camera rate while the scheduler periodically calls
/// [`drain_and_sample`]. Draining swaps the collected window out in one step, so frames appended
/// concurrently land in the next window: they are neither lost nor counted twice.
///
/// [`append`]: SkeletonBuffer::append
/// [`drain_and_sample`]: SkeletonBuffer::drain_and_sample
#[derive(Debug, Default)]
pub struct SkeletonBuffer {
    window: Mutex<Vec<Frame>>,
    received: AtomicBool,
}

impl SkeletonBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame to the current window.
    pub fn append(&self, frame: Frame) {
        self.lock().push(frame);
        self.received.store(true, Ordering::Release);
    }

    /// Returns the number of frames in the current window.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether any frame was ever appended to this buffer.
    pub fn has_received_frames(&self) -> bool {
        self.received.load(Ordering::Acquire)
    }

    /// Takes all frames of the current window, leaving an empty window behind.
    pub fn drain(&self) -> Vec<Frame> {
        mem::take(&mut *self.lock())
    }

    /// Takes the current window and resamples it to exactly `target` frames.
    ///
    /// See [`sample`] for how frames are picked.
    pub fn drain_and_sample(&self, target: usize) -> SampledSequence {
        let window = self.drain();
        log::trace!("sampling {} buffered frames down to {target}", window.len());
        sample(&window, target)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Frame>> {
        // A panic while holding the lock cannot leave a `Vec::push` half-done.
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the source indices picked when resampling `n` frames to `target` frames.
///
/// For `n >= target`, this yields `floor(i * n / target)` for each `i` in `0..target`: the indices
/// are non-decreasing, start at 0 and stay below `n`. For `n < target`, it yields `0..n` (the
/// remaining output positions are padding).
pub fn sample_indices(n: usize, target: usize) -> impl Iterator<Item = usize> {
    let (count, n_stride, t_stride) = if n >= target {
        (target, n, target)
    } else {
        (n, 1, 1)
    };
    (0..count).map(move |i| i * n_stride / t_stride)
}

/// Resamples `frames` to exactly `target` frames by uniform nearest-neighbor selection.
///
/// Frames are never interpolated. If fewer than `target` frames are available, all of them are
/// copied in order and the sequence is padded with all-zero frames at the end. An empty input
/// yields an all-zero sequence.
pub fn sample(frames: &[Frame], target: usize) -> SampledSequence {
    let mut out = Vec::with_capacity(target);
    out.extend(sample_indices(frames.len(), target).map(|i| frames[i]));
    out.resize(target, Frame::default());
    SampledSequence { frames: out }
}

/// A fixed-length sequence of frames, ready to be assembled into a classifier input.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSequence {
    frames: Vec<Frame>,
}

impl SampledSequence {
    /// Wraps `frames` without resampling.
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::landmark::NUM_JOINTS;

    /// A frame whose every value is `id`, so sampled frames can be traced back to their source.
    fn tagged(id: usize) -> Frame {
        Frame::from_joints([[id as f32 + 1.0; 3]; NUM_JOINTS])
    }

    fn tag_of(frame: &Frame) -> Option<usize> {
        if frame.is_zero() {
            None
        } else {
            Some(frame.joint(0)[0] as usize - 1)
        }
    }

    #[test]
    fn always_returns_target_length() {
        for n in 0..130 {
            let frames = (0..n).map(tagged).collect::<Vec<_>>();
            for target in [1, 40, 50, 60, 144] {
                assert_eq!(sample(&frames, target).len(), target, "n={n} target={target}");
            }
        }
    }

    #[test]
    fn downsampled_indices_are_monotonic_and_in_bounds() {
        for n in 40..500 {
            let indices = sample_indices(n, 40).collect::<Vec<_>>();
            assert_eq!(indices.len(), 40);
            assert_eq!(indices[0], 0);
            assert!(indices.windows(2).all(|w| w[0] <= w[1]), "n={n}");
            assert!(*indices.last().unwrap() < n, "n={n}");
        }
    }

    #[test]
    fn downsampling_truncates_stride() {
        // 100 frames into 40 slots: stride 2.5
        let indices = sample_indices(100, 40).take(5).collect::<Vec<_>>();
        assert_eq!(indices, [0, 2, 5, 7, 10]);
        assert_eq!(sample_indices(40, 40).collect::<Vec<_>>(), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn downsampling_picks_source_frames() {
        let frames = (0..120).map(tagged).collect::<Vec<_>>();
        let seq = sample(&frames, 40);
        let tags = seq.frames().iter().map(tag_of).collect::<Vec<_>>();
        assert_eq!(tags, (0..40).map(|i| Some(i * 3)).collect::<Vec<_>>());
    }

    #[test]
    fn short_window_is_padded() {
        let frames = (0..7).map(tagged).collect::<Vec<_>>();
        let seq = sample(&frames, 40);
        assert_eq!(&seq.frames()[..7], &frames[..]);
        assert!(seq.frames()[7..].iter().all(Frame::is_zero));
    }

    #[test]
    fn empty_window() {
        let buffer = SkeletonBuffer::new();
        let seq = buffer.drain_and_sample(50);
        assert_eq!(seq.len(), 50);
        assert!(seq.frames().iter().all(Frame::is_zero));
        assert!(!buffer.has_received_frames());
    }

    #[test]
    fn drain_clears_window() {
        let buffer = SkeletonBuffer::new();
        for i in 0..3 {
            buffer.append(tagged(i));
        }
        assert_eq!(buffer.len(), 3);
        assert!(buffer.has_received_frames());

        let seq = buffer.drain_and_sample(2);
        assert_eq!(seq.frames().iter().map(tag_of).collect::<Vec<_>>(), [Some(0), Some(1)]);
        assert!(buffer.is_empty());
        assert!(buffer.drain_and_sample(2).frames().iter().all(Frame::is_zero));
        assert!(buffer.has_received_frames());
    }

    #[test]
    fn concurrent_append_loses_nothing() {
        const FRAMES: usize = 5000;

        let buffer = Arc::new(SkeletonBuffer::new());
        let producer = thread::spawn({
            let buffer = buffer.clone();
            move || {
                for i in 0..FRAMES {
                    buffer.append(tagged(i));
                }
            }
        });

        let mut seen = Vec::new();
        while !producer.is_finished() {
            seen.extend(buffer.drain().iter().filter_map(tag_of));
        }
        producer.join().unwrap();
        seen.extend(buffer.drain().iter().filter_map(tag_of));

        assert_eq!(seen, (0..FRAMES).collect::<Vec<_>>());
    }
}
