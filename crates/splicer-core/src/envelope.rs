use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::SplicerError;

/// Operator parameter driven by gain curves: the first parameter of the amplify operator.
pub const AMPLIFY_PARAMETER: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmplitudeDomain {
    /// 0 to 100, used for bed levels and other absolute gains.
    Percent,
    /// 0.0 to 1.0, used for per-track crossfades.
    Unit,
}

impl AmplitudeDomain {
    #[must_use]
    pub const fn ceiling(self) -> f64 {
        match self {
            Self::Percent => 100.0,
            Self::Unit => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CurveShape {
    Linear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Keyframe {
    pub time: f64,
    pub amplitude: f64,
}

/// Validated on construction and on deserialization alike, so a curve always has keyframes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "CurveFields")]
pub struct EnvelopeCurve {
    shape: CurveShape,
    domain: AmplitudeDomain,
    keyframes: Vec<Keyframe>,
}

#[derive(Deserialize)]
struct CurveFields {
    shape: CurveShape,
    domain: AmplitudeDomain,
    keyframes: Vec<Keyframe>,
}

impl TryFrom<CurveFields> for EnvelopeCurve {
    type Error = SplicerError;

    fn try_from(fields: CurveFields) -> Result<Self, Self::Error> {
        Self::new(fields.shape, fields.domain, fields.keyframes)
    }
}

impl EnvelopeCurve {
    pub fn new(
        shape: CurveShape,
        domain: AmplitudeDomain,
        keyframes: Vec<Keyframe>,
    ) -> Result<Self, SplicerError> {
        if keyframes.is_empty() {
            return Err(SplicerError::configuration(
                "envelope curve needs at least one keyframe",
            ));
        }

        for keyframe in &keyframes {
            if !keyframe.time.is_finite() {
                return Err(SplicerError::configuration(format!(
                    "envelope keyframe time is not finite: {}",
                    keyframe.time
                )));
            }
            if !(0.0..=domain.ceiling()).contains(&keyframe.amplitude) {
                return Err(SplicerError::configuration(format!(
                    "amplitude {} outside the {domain:?} domain (0..={})",
                    keyframe.amplitude,
                    domain.ceiling()
                )));
            }
        }

        Ok(Self {
            shape,
            domain,
            keyframes,
        })
    }

    #[must_use]
    pub fn shape(&self) -> CurveShape {
        self.shape
    }

    #[must_use]
    pub fn domain(&self) -> AmplitudeDomain {
        self.domain
    }

    #[must_use]
    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    /// Amplitude at `time`, holding the first and last keyframe values outside the curve.
    #[must_use]
    pub fn amplitude_at(&self, time: f64) -> f64 {
        let (Some(&first), Some(&last)) = (self.keyframes.first(), self.keyframes.last()) else {
            return 0.0;
        };
        if time <= first.time {
            return first.amplitude;
        }

        for pair in self.keyframes.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            if time <= right.time {
                let span = right.time - left.time;
                if span <= 0.0 {
                    return right.amplitude;
                }
                let ratio = (time - left.time) / span;
                return left.amplitude + (right.amplitude - left.amplitude) * ratio;
            }
        }

        last.amplitude
    }

    /// Generic linear-envelope controller spec for the engine, scaled onto the 0..100 range of
    /// the amplify operator.
    #[must_use]
    pub fn to_controller(&self, parameter: u32) -> String {
        let mut spec = format!("-klg:{parameter},0,100,{}", self.keyframes.len());
        let ceiling = self.domain.ceiling();
        for keyframe in &self.keyframes {
            let _ = write!(spec, ",{},{}", keyframe.time, keyframe.amplitude / ceiling);
        }
        spec
    }
}

/// Four-point trapezoid: silent at the window edges, `peak` between the fades.
pub fn build_fade_curve(
    fade_in_start: f64,
    fade_in_end: f64,
    fade_out_start: f64,
    fade_out_end: f64,
    peak: f64,
    domain: AmplitudeDomain,
) -> Result<EnvelopeCurve, SplicerError> {
    EnvelopeCurve::new(
        CurveShape::Linear,
        domain,
        vec![
            Keyframe {
                time: fade_in_start,
                amplitude: 0.0,
            },
            Keyframe {
                time: fade_in_end,
                amplitude: peak,
            },
            Keyframe {
                time: fade_out_start,
                amplitude: peak,
            },
            Keyframe {
                time: fade_out_end,
                amplitude: 0.0,
            },
        ],
    )
}
