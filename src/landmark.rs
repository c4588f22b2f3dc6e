//! Pose landmarks and skeleton frames.
//!
//! A [`Pose`] is what the external pose detector produces for one camera frame: one [`Landmark`]
//! per [`Joint`], each with a visibility score. A [`Frame`] is the normalized skeleton derived from
//! it, holding 3 channels (`x`, `y`, `z`) per joint and nothing else.
//!
//! Only the first [`NUM_JOINTS`] landmarks of the BlazePose topology are used. Pose detectors that
//! report more (BlazePose has 33, plus auxiliary landmarks) are truncated.

use anyhow::bail;

/// Number of joints per skeleton frame.
pub const NUM_JOINTS: usize = 25;

/// Number of values stored per joint in a [`Frame`].
pub const NUM_CHANNELS: usize = 3;

/// Landmarks with a visibility below this value are not trusted.
pub const VISIBILITY_THRESHOLD: f32 = 0.75;

/// Anatomical joint indices, in the order used by MediaPipe and ML Kit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joint {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
}

impl Joint {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A detected body joint position with a confidence score.
#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct Landmark {
    pos: [f32; 3],
    visibility: f32,
}

impl Landmark {
    /// Creates a landmark at `position` with a visibility of `0.0`.
    pub fn new(position: [f32; 3]) -> Self {
        Self {
            pos: position,
            visibility: 0.0,
        }
    }

    pub fn with_visibility(self, visibility: f32) -> Self {
        Self { visibility, ..self }
    }

    #[inline]
    pub fn position(&self) -> [f32; 3] {
        self.pos
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.pos[0]
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.pos[1]
    }

    #[inline]
    pub fn z(&self) -> f32 {
        self.pos[2]
    }

    /// Likelihood (0.0 to 1.0) that the landmark is visible in the camera image.
    #[inline]
    pub fn visibility(&self) -> f32 {
        self.visibility
    }

    /// Returns whether the visibility reaches [`VISIBILITY_THRESHOLD`].
    #[inline]
    pub fn is_reliable(&self) -> bool {
        self.visibility >= VISIBILITY_THRESHOLD
    }
}

/// The landmarks of one detected pose, indexed by [`Joint`].
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    landmarks: [Landmark; NUM_JOINTS],
}

impl Pose {
    /// Creates a pose from a list of landmarks.
    ///
    /// Landmarks past [`NUM_JOINTS`] are ignored. Returns an error if fewer than [`NUM_JOINTS`]
    /// landmarks are provided.
    pub fn from_landmarks<I: IntoIterator<Item = Landmark>>(landmarks: I) -> anyhow::Result<Self> {
        let mut out = [Landmark::default(); NUM_JOINTS];
        let mut count = 0;
        for (slot, lm) in out.iter_mut().zip(landmarks) {
            *slot = lm;
            count += 1;
        }
        if count < NUM_JOINTS {
            bail!("pose has {count} landmarks, at least {NUM_JOINTS} are required");
        }
        Ok(Self { landmarks: out })
    }

    /// Decodes the flat screen-landmark output of a BlazePose landmark network.
    ///
    /// The network emits 5 values per landmark: `x`, `y`, `z`, visibility and presence. Visibility
    /// is a logit and gets mapped to 0.0..=1.0 with the sigmoid function; presence is ignored.
    pub fn from_network_output(raw: &[f32]) -> anyhow::Result<Self> {
        if raw.len() % 5 != 0 {
            bail!(
                "landmark network output has {} values, expected a multiple of 5",
                raw.len()
            );
        }
        Self::from_landmarks(
            raw.chunks_exact(5)
                .map(|lm| Landmark::new([lm[0], lm[1], lm[2]]).with_visibility(sigmoid(lm[3]))),
        )
    }

    #[inline]
    pub fn get(&self, joint: Joint) -> Landmark {
        self.landmarks[joint.index()]
    }

    pub fn landmarks(&self) -> &[Landmark; NUM_JOINTS] {
        &self.landmarks
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// A normalized skeleton frame: `x`, `y` and `z` for each of the [`NUM_JOINTS`] joints.
///
/// Unreliable joints are stored as `[0.0, 0.0, 0.0]`. [`Frame::default`] is the all-zero frame
/// used for padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    joints: [[f32; NUM_CHANNELS]; NUM_JOINTS],
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            joints: [[0.0; NUM_CHANNELS]; NUM_JOINTS],
        }
    }
}

impl Frame {
    pub fn from_joints(joints: [[f32; NUM_CHANNELS]; NUM_JOINTS]) -> Self {
        Self { joints }
    }

    #[inline]
    pub fn joint(&self, index: usize) -> [f32; NUM_CHANNELS] {
        self.joints[index]
    }

    #[inline]
    pub fn set_joint(&mut self, index: usize, value: [f32; NUM_CHANNELS]) {
        self.joints[index] = value;
    }

    pub fn joints(&self) -> &[[f32; NUM_CHANNELS]; NUM_JOINTS] {
        &self.joints
    }

    /// Returns whether every value in this frame is `0.0`.
    pub fn is_zero(&self) -> bool {
        self.joints.iter().flatten().all(|&v| v == 0.0)
    }
}
