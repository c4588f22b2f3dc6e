//! Classifier input tensor assembly.
//!
//! The action classifier is a graph-convolutional network that expects its input in channel-major
//! order: `[batch, channel, time, joint, person]`, with a batch size of 1 and one channel each for
//! the `x`, `y` and `z` coordinates.

use anyhow::bail;

use crate::buffer::SampledSequence;
use crate::landmark::{Frame, NUM_CHANNELS, NUM_JOINTS};
use crate::nn::tensor::Tensor;

/// The input tensor layout expected by a particular classifier model.
///
/// Models are trained with a fixed time axis length and a fixed number of person slots. Only the
/// first person slot is ever filled; the others stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
    frames: usize,
    persons: usize,
}

impl TensorLayout {
    /// `[1, 3, 50, 25, 1]`
    pub const SINGLE_PERSON_50: Self = Self {
        frames: 50,
        persons: 1,
    };

    /// `[1, 3, 144, 25, 2]`
    pub const TWO_PERSON_144: Self = Self {
        frames: 144,
        persons: 2,
    };

    /// Creates a tensor layout with `frames` time steps and `persons` person slots.
    ///
    /// # Panics
    ///
    /// Panics if `frames` or `persons` is 0.
    pub fn new(frames: usize, persons: usize) -> Self {
        assert!(
            frames > 0 && persons > 0,
            "invalid tensor layout: {frames} frames, {persons} persons"
        );
        Self { frames, persons }
    }

    /// Length of the time axis.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn persons(&self) -> usize {
        self.persons
    }

    /// Returns the full tensor shape, `[1, 3, frames, 25, persons]`.
    pub fn shape(&self) -> [usize; 5] {
        [1, NUM_CHANNELS, self.frames, NUM_JOINTS, self.persons]
    }

    /// Reorders a frame sequence into a classifier input tensor.
    ///
    /// Time steps past the end of `seq` are zero, as are all person slots except the first.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is longer than the time axis of this layout.
    pub fn assemble(&self, seq: &SampledSequence) -> Tensor {
        assert!(
            seq.len() <= self.frames,
            "{} frames do not fit into a time axis of {}",
            seq.len(),
            self.frames,
        );

        let frames = seq.frames();
        Tensor::from_array_shape_fn(self.shape(), |[_, c, t, j, m]| {
            match frames.get(t) {
                Some(frame) if m == 0 => frame.joint(j)[c],
                _ => 0.0,
            }
        })
    }

    /// Recovers the frame sequence of the first person slot from an assembled tensor.
    ///
    /// The returned sequence always covers the whole time axis, including padding.
    pub fn disassemble(&self, tensor: &Tensor) -> anyhow::Result<SampledSequence> {
        if tensor.shape() != self.shape() {
            bail!(
                "tensor shape {:?} does not match layout {:?}",
                tensor.shape(),
                self.shape()
            );
        }

        let frames = (0..self.frames)
            .map(|t| {
                let mut frame = Frame::default();
                for j in 0..NUM_JOINTS {
                    let mut joint = [0.0; NUM_CHANNELS];
                    for (c, value) in joint.iter_mut().enumerate() {
                        *value = tensor.get([0, c, t, j, 0]);
                    }
                    frame.set_joint(j, joint);
                }
                frame
            })
            .collect();
        Ok(SampledSequence::from_frames(frames))
    }
}

impl Default for TensorLayout {
    fn default() -> Self {
        Self::SINGLE_PERSON_50
    }
}
