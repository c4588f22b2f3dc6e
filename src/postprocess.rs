//! Classifier score postprocessing and label smoothing.
//!
//! The classifier distinguishes [`NUM_CLASSES`] fine-grained actions. Only two of them are of
//! interest ([`PAINTING_CLASS`] and [`INTERVIEW_CLASS`]); all others are summed up into a single
//! "other" bucket. The resulting label is smoothed by requiring two consecutive identical
//! observations before the displayed label changes.

use std::fmt;

use anyhow::bail;

/// Number of scores output by the classifier.
pub const NUM_CLASSES: usize = 19;

/// Index of the "painting" class in the classifier output.
pub const PAINTING_CLASS: usize = 17;

/// Index of the "interview" class in the classifier output.
pub const INTERVIEW_CLASS: usize = 18;

/// Coarse activity classes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Any of the fine-grained classes below [`PAINTING_CLASS`].
    #[default]
    Other = 0,
    Painting = 1,
    Interview = 2,
}

impl Activity {
    const ALL: [Activity; 3] = [Activity::Other, Activity::Painting, Activity::Interview];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Computes the softmax of `scores`.
///
/// The exponentials are not shifted by the maximum score before normalization, which matches the
/// pipeline the classifier was validated with. Scores above ~88 overflow `f32` and make the result
/// NaN; a warning is logged when that happens.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let mut out = scores
        .iter()
        .map(|&s| f64::from(s).exp() as f32)
        .collect::<Vec<_>>();
    let sum: f32 = out.iter().sum();
    if !sum.is_finite() {
        log::warn!("softmax denominator is {sum}, scores are out of range: {scores:?}");
    }
    for p in &mut out {
        *p /= sum;
    }
    out
}

/// Collapses class probabilities into the per-[`Activity`] probabilities.
pub fn aggregate(probs: &[f32]) -> anyhow::Result<[f32; 3]> {
    if probs.len() < NUM_CLASSES {
        bail!(
            "classifier returned {} scores, expected {NUM_CLASSES}",
            probs.len()
        );
    }
    Ok([
        probs[..PAINTING_CLASS].iter().sum(),
        probs[PAINTING_CLASS],
        probs[INTERVIEW_CLASS],
    ])
}

/// Returns the activity with the highest probability, preferring the lowest index on ties.
pub fn top1(activities: &[f32; 3]) -> Activity {
    let mut best = 0;
    for i in 1..activities.len() {
        if activities[i] > activities[best] {
            best = i;
        }
    }
    Activity::ALL[best]
}

/// Hysteresis state of the displayed label.
///
/// A new raw observation only replaces the committed label if it repeats the previous raw
/// observation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LabelState {
    previous_raw: Activity,
    committed: Activity,
}

impl LabelState {
    /// Feeds a raw top-1 observation into the state, returning the committed label.
    pub fn update(&mut self, raw: Activity) -> Activity {
        if self.committed != raw && self.previous_raw == raw {
            self.committed = raw;
        }
        self.previous_raw = raw;
        self.committed
    }

    #[inline]
    pub fn committed(&self) -> Activity {
        self.committed
    }

    #[inline]
    pub fn previous_raw(&self) -> Activity {
        self.previous_raw
    }
}

/// Display color hint attached to a [`DisplayLabel`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LabelColor {
    #[default]
    Normal,
    Alert,
}

/// How the [`Activity::Other`] label is displayed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OtherLabel {
    /// Display nothing.
    #[default]
    Hidden,
    /// Display `Other`.
    Named,
}

/// Rounds to one decimal, with ties rounded away from zero (`12.25` becomes `12.3`).
fn round_half_up(value: f32) -> f64 {
    (f64::from(value) * 10.0).round() / 10.0
}

/// The label shown to the user after a classification tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DisplayLabel {
    text: String,
    color: LabelColor,
    activity: Option<(Activity, f32)>,
}

impl DisplayLabel {
    /// The label published when no classification result is available.
    pub fn empty() -> Self {
        Self::default()
    }

    fn render(activity: Activity, probability: f32, other: OtherLabel) -> Self {
        let percent = round_half_up(probability * 100.0);
        let text = match (activity, other) {
            (Activity::Other, OtherLabel::Hidden) => String::new(),
            (Activity::Other, OtherLabel::Named) => "Other".to_string(),
            (Activity::Painting, _) => format!("Painting:{percent:.1}%"),
            (Activity::Interview, _) => format!("Interview:{percent:.1}%"),
        };
        let color = match activity {
            Activity::Painting => LabelColor::Alert,
            _ => LabelColor::Normal,
        };
        Self {
            text,
            color,
            activity: Some((activity, probability)),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn color(&self) -> LabelColor {
        self.color
    }

    /// Returns the committed activity and its probability in the tick that produced this label.
    ///
    /// Returns [`None`] for [`DisplayLabel::empty`].
    pub fn activity(&self) -> Option<(Activity, f32)> {
        self.activity
    }
}

impl fmt::Display for DisplayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Turns raw classifier scores into smoothed [`DisplayLabel`]s.
#[derive(Debug, Default, Clone)]
pub struct ScorePostprocessor {
    state: LabelState,
    other: OtherLabel,
}

impl ScorePostprocessor {
    pub fn new(other: OtherLabel) -> Self {
        Self {
            state: LabelState::default(),
            other,
        }
    }

    pub fn state(&self) -> LabelState {
        self.state
    }

    /// Classifies a raw score vector.
    ///
    /// This never fails: a malformed score vector is logged and results in
    /// [`DisplayLabel::empty`], without touching the label state.
    pub fn classify(&mut self, scores: &[f32]) -> DisplayLabel {
        match self.try_classify(scores) {
            Ok(label) => label,
            Err(e) => {
                log::error!("failed to postprocess classifier scores: {e}");
                DisplayLabel::empty()
            }
        }
    }

    fn try_classify(&mut self, scores: &[f32]) -> anyhow::Result<DisplayLabel> {
        let activities = aggregate(&softmax(scores))?;
        let raw = top1(&activities);
        let committed = self.state.update(raw);
        log::trace!("activities {activities:?}, raw {raw:?}, committed {committed:?}");

        Ok(DisplayLabel::render(
            committed,
            activities[committed.index()],
            self.other,
        ))
    }
}
