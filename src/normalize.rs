//! Landmark normalization.
//!
//! Turns a raw [`Pose`] into a translation- and scale-invariant [`Frame`] that is corrected for the
//! orientation of the device. How coordinates are scaled is selected with a [`Normalization`]
//! policy, since different classifier models were trained on differently prepared skeletons.

use nalgebra::Vector3;

use crate::landmark::{Frame, Joint, Pose, VISIBILITY_THRESHOLD};

/// A reference bone used to calibrate the scale of a skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Shoulders,
    Ears,
    Hips,
    Eyes,
}

impl Anchor {
    /// Anchors in the order they are tried by [`LandmarkNormalizer`].
    pub const PRIORITY: [Anchor; 4] = [Anchor::Shoulders, Anchor::Ears, Anchor::Hips, Anchor::Eyes];

    /// Returns the pair of joints spanning this bone.
    pub fn joints(self) -> (Joint, Joint) {
        match self {
            Anchor::Shoulders => (Joint::LeftShoulder, Joint::RightShoulder),
            Anchor::Ears => (Joint::LeftEar, Joint::RightEar),
            Anchor::Hips => (Joint::LeftHip, Joint::RightHip),
            Anchor::Eyes => (Joint::LeftEye, Joint::RightEye),
        }
    }

    /// Length of this bone in a canonical body, relative to the body height.
    pub fn reference_ratio(self) -> f32 {
        match self {
            Anchor::Shoulders => 0.325,
            Anchor::Ears => 0.148,
            Anchor::Hips => 0.221,
            Anchor::Eyes => 0.0325,
        }
    }

    /// Average visibility of both endpoints in `pose`.
    fn confidence(self, pose: &Pose) -> f32 {
        let (a, b) = self.joints();
        (pose.get(a).visibility() + pose.get(b).visibility()) / 2.0
    }

    fn length(self, pose: &Pose) -> f32 {
        let (a, b) = self.joints();
        (position(pose, a) - position(pose, b)).norm()
    }
}

fn position(pose: &Pose, joint: Joint) -> Vector3<f32> {
    Vector3::from(pose.get(joint).position())
}

/// Device orientation, bucketed to multiples of 90°.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Buckets a screen rotation angle into 90°-wide ranges centered on 0°, 90°, 180° and 270°.
    ///
    /// Angles outside of `0..360` are wrapped, so the `-1` reported by Android for an unknown
    /// orientation maps to [`Orientation::Deg0`].
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            45..=134 => Orientation::Deg90,
            135..=224 => Orientation::Deg180,
            225..=314 => Orientation::Deg270,
            _ => Orientation::Deg0,
        }
    }

    /// Rotates an `(x, y)` pair. Depth is never rotated.
    pub fn rotate(self, [x, y]: [f32; 2]) -> [f32; 2] {
        match self {
            Orientation::Deg0 => [x, y],
            Orientation::Deg90 => [-y, x],
            Orientation::Deg180 => [-x, -y],
            Orientation::Deg270 => [y, -x],
        }
    }
}

/// Selects how landmark coordinates are scaled before they are buffered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// Coordinates are centered on the hips and scaled by the length of an [`Anchor`] bone.
    ///
    /// `start` is the anchor in effect until the first pose with a confident anchor arrives.
    Anchored { start: Anchor },
    /// Coordinates are centered on the hips and divided by half of the screen size.
    ///
    /// `x` and `z` are divided by half the width, `y` by half the height.
    ScreenExtent { width: u32, height: u32 },
    /// Coordinates are used as reported by the pose detector.
    ///
    /// This is meant for world landmarks, which are already metric and centered on the hips.
    Passthrough,
}

impl Default for Normalization {
    fn default() -> Self {
        Self::Anchored {
            start: Anchor::Shoulders,
        }
    }
}

/// Converts [`Pose`]s into normalized [`Frame`]s.
///
/// With [`Normalization::Anchored`], the normalizer remembers the last anchor bone that was
/// visible with enough confidence and keeps using it while no anchor qualifies.
#[derive(Debug, Clone)]
pub struct LandmarkNormalizer {
    policy: Normalization,
    anchor: Anchor,
    last_scale: Option<f32>,
}

impl LandmarkNormalizer {
    /// Creates a normalizer using the given policy.
    ///
    /// # Panics
    ///
    /// Panics if a [`Normalization::ScreenExtent`] policy has a width or height below 2.
    pub fn new(policy: Normalization) -> Self {
        if let Normalization::ScreenExtent { width, height } = policy {
            assert!(
                width >= 2 && height >= 2,
                "invalid screen size {width}x{height}"
            );
        }
        let anchor = match policy {
            Normalization::Anchored { start } => start,
            _ => Anchor::Shoulders,
        };
        Self {
            policy,
            anchor,
            last_scale: None,
        }
    }

    pub fn policy(&self) -> Normalization {
        self.policy
    }

    /// Returns the anchor bone currently used for scaling.
    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    /// Updates the screen size used by [`Normalization::ScreenExtent`].
    ///
    /// Sizes below 2 pixels (eg. a view that has not been laid out yet) are ignored. Other policies
    /// ignore this call.
    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        if let Normalization::ScreenExtent { .. } = self.policy {
            if width < 2 || height < 2 {
                log::warn!("ignoring screen size {width}x{height}");
                return;
            }
            self.policy = Normalization::ScreenExtent { width, height };
        }
    }

    /// Normalizes `pose`, correcting for a device rotated by `orientation_degrees`.
    ///
    /// Joints with a visibility below [`VISIBILITY_THRESHOLD`] are left at zero.
    pub fn normalize(&mut self, pose: &Pose, orientation_degrees: i32) -> Frame {
        let orientation = Orientation::from_degrees(orientation_degrees);

        let hip_center =
            (position(pose, Joint::LeftHip) + position(pose, Joint::RightHip)) / 2.0;
        let (origin, scale) = match self.policy {
            Normalization::Anchored { .. } => match self.anchor_scale(pose) {
                Some(scale) => (hip_center, Vector3::repeat(scale)),
                None => {
                    log::trace!("no usable anchor length yet, dropping pose");
                    return Frame::default();
                }
            },
            Normalization::ScreenExtent { width, height } => {
                // Integer halving, as the view size is reported in whole pixels.
                let (half_w, half_h) = ((width / 2) as f32, (height / 2) as f32);
                (
                    hip_center,
                    Vector3::new(1.0 / half_w, 1.0 / half_h, 1.0 / half_w),
                )
            }
            Normalization::Passthrough => (Vector3::zeros(), Vector3::repeat(1.0)),
        };

        let mut frame = Frame::default();
        for (i, lm) in pose.landmarks().iter().enumerate() {
            if !lm.is_reliable() {
                continue;
            }
            let p = (Vector3::from(lm.position()) - origin).component_mul(&scale);
            let [x, y] = orientation.rotate([p.x, p.y]);
            frame.set_joint(i, [x, y, p.z]);
        }
        frame
    }

    /// Picks the anchor for `pose` and computes the scale factor from it.
    fn anchor_scale(&mut self, pose: &Pose) -> Option<f32> {
        if let Some(anchor) = Anchor::PRIORITY
            .into_iter()
            .find(|anchor| anchor.confidence(pose) > VISIBILITY_THRESHOLD)
        {
            if anchor != self.anchor {
                log::trace!("switching scale anchor {:?} -> {:?}", self.anchor, anchor);
            }
            self.anchor = anchor;
        }

        let scale = self.anchor.reference_ratio() / self.anchor.length(pose);
        if scale.is_finite() {
            self.last_scale = Some(scale);
            Some(scale)
        } else {
            // Both endpoints coincide; keep the previous calibration.
            self.last_scale
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::landmark::{Landmark, NUM_JOINTS};

    fn pose_with(f: impl FnMut(usize) -> Landmark) -> Pose {
        Pose::from_landmarks((0..NUM_JOINTS).map(f)).unwrap()
    }

    /// A fully visible pose with hips at `(±1, 0, 0)` and shoulders at `(±1, 2, 0)`.
    fn upright_pose(visibility: f32) -> Pose {
        pose_with(|i| {
            let pos = match i {
                i if i == Joint::LeftHip.index() => [-1.0, 0.0, 0.0],
                i if i == Joint::RightHip.index() => [1.0, 0.0, 0.0],
                i if i == Joint::LeftShoulder.index() => [-1.0, 2.0, 0.0],
                i if i == Joint::RightShoulder.index() => [1.0, 2.0, 0.0],
                i if i == Joint::LeftEar.index() => [-0.5, 3.0, 0.0],
                i if i == Joint::RightEar.index() => [0.5, 3.0, 0.0],
                i => [0.1 * i as f32, 1.0, 0.5],
            };
            Landmark::new(pos).with_visibility(visibility)
        })
    }

    #[test]
    fn orientation_buckets() {
        assert_eq!(Orientation::from_degrees(0), Orientation::Deg0);
        assert_eq!(Orientation::from_degrees(44), Orientation::Deg0);
        assert_eq!(Orientation::from_degrees(45), Orientation::Deg90);
        assert_eq!(Orientation::from_degrees(134), Orientation::Deg90);
        assert_eq!(Orientation::from_degrees(135), Orientation::Deg180);
        assert_eq!(Orientation::from_degrees(200), Orientation::Deg180);
        assert_eq!(Orientation::from_degrees(225), Orientation::Deg270);
        assert_eq!(Orientation::from_degrees(314), Orientation::Deg270);
        assert_eq!(Orientation::from_degrees(315), Orientation::Deg0);
        assert_eq!(Orientation::from_degrees(359), Orientation::Deg0);
        assert_eq!(Orientation::from_degrees(-1), Orientation::Deg0);
        assert_eq!(Orientation::from_degrees(450), Orientation::Deg90);
    }

    #[test]
    fn rotations() {
        assert_eq!(Orientation::Deg0.rotate([2.0, 3.0]), [2.0, 3.0]);
        assert_eq!(Orientation::Deg90.rotate([2.0, 3.0]), [-3.0, 2.0]);
        assert_eq!(Orientation::Deg180.rotate([2.0, 3.0]), [-2.0, -3.0]);
        assert_eq!(Orientation::Deg270.rotate([2.0, 3.0]), [3.0, -2.0]);
    }

    #[test]
    fn rotated_200_degrees() {
        let pose = pose_with(|i| {
            if i == Joint::Nose.index() {
                Landmark::new([2.0, 3.0, 7.0]).with_visibility(1.0)
            } else {
                Landmark::default()
            }
        });
        let mut normalizer = LandmarkNormalizer::new(Normalization::Passthrough);
        let frame = normalizer.normalize(&pose, 200);
        assert_eq!(frame.joint(Joint::Nose.index()), [-2.0, -3.0, 7.0]);
    }

    #[test]
    fn unreliable_joints_are_zero() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for policy in [
            Normalization::default(),
            Normalization::ScreenExtent {
                width: 1080,
                height: 1920,
            },
            Normalization::Passthrough,
        ] {
            let mut normalizer = LandmarkNormalizer::new(policy);
            for _ in 0..100 {
                let pose = pose_with(|_| {
                    Landmark::new([
                        rng.f32() * 100.0 - 50.0,
                        rng.f32() * 100.0 - 50.0,
                        rng.f32() * 100.0 - 50.0,
                    ])
                    .with_visibility(rng.f32())
                });
                let frame = normalizer.normalize(&pose, rng.i32(0..360));
                for (lm, joint) in pose.landmarks().iter().zip(frame.joints()) {
                    if !lm.is_reliable() {
                        assert_eq!(*joint, [0.0, 0.0, 0.0]);
                    }
                }
            }
        }
    }

    #[test]
    fn anchored_scale() {
        let mut normalizer = LandmarkNormalizer::new(Normalization::default());
        let frame = normalizer.normalize(&upright_pose(1.0), 0);
        assert_eq!(normalizer.anchor(), Anchor::Shoulders);

        // Shoulder width is 2, so everything is scaled by 0.325 / 2.
        let scale = 0.325 / 2.0;
        assert_relative_eq!(frame.joint(Joint::LeftHip.index())[0], -scale);
        assert_relative_eq!(frame.joint(Joint::RightShoulder.index())[0], scale);
        assert_relative_eq!(frame.joint(Joint::RightShoulder.index())[1], 2.0 * scale);
    }

    #[test]
    fn anchor_falls_back_in_priority_order() {
        let mut pose = upright_pose(1.0);
        let mut landmarks = *pose.landmarks();
        for joint in [Joint::LeftShoulder, Joint::RightShoulder] {
            landmarks[joint.index()] = landmarks[joint.index()].with_visibility(0.5);
        }
        pose = Pose::from_landmarks(landmarks).unwrap();

        let mut normalizer = LandmarkNormalizer::new(Normalization::default());
        let frame = normalizer.normalize(&pose, 0);
        assert_eq!(normalizer.anchor(), Anchor::Ears);
        // Ear distance is 1.
        assert_relative_eq!(frame.joint(Joint::RightHip.index())[0], 0.148);
    }

    #[test]
    fn anchor_is_sticky() {
        let mut normalizer = LandmarkNormalizer::new(Normalization::Anchored {
            start: Anchor::Hips,
        });
        assert_eq!(normalizer.anchor(), Anchor::Hips);

        normalizer.normalize(&upright_pose(1.0), 0);
        assert_eq!(normalizer.anchor(), Anchor::Shoulders);

        // Nothing is confident anymore, so the shoulders stay in effect.
        normalizer.normalize(&upright_pose(0.7), 0);
        assert_eq!(normalizer.anchor(), Anchor::Shoulders);
    }

    #[test]
    fn anchor_threshold_is_exclusive() {
        let mut normalizer = LandmarkNormalizer::new(Normalization::Anchored {
            start: Anchor::Eyes,
        });
        normalizer.normalize(&upright_pose(0.75), 0);
        assert_eq!(normalizer.anchor(), Anchor::Eyes);
    }

    #[test]
    fn degenerate_anchor_keeps_previous_scale() {
        let mut normalizer = LandmarkNormalizer::new(Normalization::default());
        let first = normalizer.normalize(&upright_pose(1.0), 0);

        let collapsed = pose_with(|i| {
            let lm = upright_pose(1.0).landmarks()[i];
            if i == Joint::RightShoulder.index() {
                Landmark::new([-1.0, 2.0, 0.0]).with_visibility(1.0)
            } else {
                lm
            }
        });
        let second = normalizer.normalize(&collapsed, 0);
        assert_eq!(
            first.joint(Joint::LeftHip.index()),
            second.joint(Joint::LeftHip.index())
        );

        // Without a previous calibration there is nothing to fall back to.
        let mut fresh = LandmarkNormalizer::new(Normalization::default());
        assert!(fresh.normalize(&collapsed, 0).is_zero());
    }

    #[test]
    fn screen_extent() {
        let mut normalizer = LandmarkNormalizer::new(Normalization::ScreenExtent {
            width: 101,
            height: 200,
        });
        let frame = normalizer.normalize(&upright_pose(1.0), 0);
        // Half width is 50 (integer division), half height is 100.
        assert_relative_eq!(frame.joint(Joint::RightShoulder.index())[0], 1.0 / 50.0);
        assert_relative_eq!(frame.joint(Joint::RightShoulder.index())[1], 2.0 / 100.0);
        assert_relative_eq!(frame.joint(Joint::Nose.index())[2], 0.5 / 50.0);

        normalizer.set_screen_size(0, 0);
        assert_eq!(
            normalizer.policy(),
            Normalization::ScreenExtent {
                width: 101,
                height: 200
            }
        );
        normalizer.set_screen_size(400, 400);
        let frame = normalizer.normalize(&upright_pose(1.0), 0);
        assert_relative_eq!(frame.joint(Joint::RightShoulder.index())[0], 1.0 / 200.0);
    }

    #[test]
    #[should_panic]
    fn zero_screen_extent_panics() {
        LandmarkNormalizer::new(Normalization::ScreenExtent {
            width: 0,
            height: 100,
        });
    }
}
