//! Configurable image processing pipeline applied to raw sensor output.
//!
//! A pipeline is an ordered list of [`ProcessingStep`]s followed by a cast to
//! the declared [`OutputDepth`]. Each step maps an `f64` array to another
//! `f64` array of whatever shape it likes; only the final cast is typed.

use std::{fmt, str::FromStr, sync::Arc};

use ndarray::{ArrayD, ArrayViewD, Axis, Ix2};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    bayer::BayerPhase,
    demosaic::{Bilinear, Demosaic},
    error::{Error, Result},
    sensor::DEFAULT_MAX_DN,
};

/// Numeric width of a pipeline's final output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OutputDepth {
    #[default]
    U8,
    U16,
}

impl OutputDepth {
    pub fn max_value(self) -> f64 {
        match self {
            OutputDepth::U8 => u8::MAX as f64,
            OutputDepth::U16 => u16::MAX as f64,
        }
    }
}

/// The final, typed result of a pipeline run.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputImage {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
}

impl OutputImage {
    pub fn depth(&self) -> OutputDepth {
        match self {
            OutputImage::U8(_) => OutputDepth::U8,
            OutputImage::U16(_) => OutputDepth::U16,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            OutputImage::U8(data) => data.shape(),
            OutputImage::U16(data) => data.shape(),
        }
    }

    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        match self {
            OutputImage::U8(data) => Some(data),
            OutputImage::U16(_) => None,
        }
    }

    pub fn as_u16(&self) -> Option<&ArrayD<u16>> {
        match self {
            OutputImage::U16(data) => Some(data),
            OutputImage::U8(_) => None,
        }
    }

    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            OutputImage::U8(data) => data.mapv(f64::from),
            OutputImage::U16(data) => data.mapv(f64::from),
        }
    }

    /// Round, clamp into the depth's range and cast.
    fn cast(data: ArrayD<f64>, depth: OutputDepth) -> Self {
        let max = depth.max_value();
        let clamp = move |v: f64| v.round().clamp(0.0, max);
        match depth {
            OutputDepth::U8 => OutputImage::U8(data.mapv(|v| clamp(v) as u8)),
            OutputDepth::U16 => OutputImage::U16(data.mapv(|v| clamp(v) as u16)),
        }
    }
}

/// Signature of a caller-supplied step.
pub type StepFn = dyn Fn(ArrayD<f64>) -> Result<ArrayD<f64>> + Send + Sync;

/// A caller-supplied step.
///
/// The wrapped closure is opaque: it cannot be inspected, compared (beyond
/// identity) or serialized.
#[derive(Clone)]
pub struct CustomStep {
    name: String,
    func: Arc<StepFn>,
}

impl CustomStep {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ArrayD<f64>) -> Result<ArrayD<f64>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for CustomStep {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.func, &other.func)
    }
}

/// One operation of a [`ProcessingPipeline`] with its parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "op", rename_all = "snake_case"))]
pub enum ProcessingStep {
    /// Single-channel Bayer data to `(H, W, 3)` color.
    Demosaic { phase: BayerPhase },
    /// `out = in / in_max * out_max`.
    Rescale { in_max: f64, out_max: f64 },
    /// `out = (in / max_val)^gamma * max_val`. Pass the reciprocal of the
    /// display gamma to encode, e.g. `1 / 2.2`.
    GammaEncode { gamma: f64, max_val: f64 },
    /// Per-channel gain on `(H, W, 3)` data.
    WhiteBalance { gains: [f64; 3] },
    /// Subtract a black level, flooring at zero.
    BlackLevel { offset: f64 },
    #[cfg_attr(feature = "serde", serde(skip))]
    Custom(CustomStep),
}

fn malformed(op: &str, reason: impl fmt::Display) -> Error {
    Error::MalformedStep(format!("{op}: {reason}"))
}

fn parse_number(op: &str, text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| malformed(op, format!("`{text}` is not a number")))
}

impl ProcessingStep {
    /// The operation name used in the textual form.
    pub fn op(&self) -> &str {
        match self {
            ProcessingStep::Demosaic { .. } => "demosaic",
            ProcessingStep::Rescale { .. } => "rescale",
            ProcessingStep::GammaEncode { .. } => "gamma",
            ProcessingStep::WhiteBalance { .. } => "white_balance",
            ProcessingStep::BlackLevel { .. } => "black_level",
            ProcessingStep::Custom(step) => step.name(),
        }
    }

    /// Build a step from an operation name and its parameter list.
    pub fn from_parts(op: &str, params: &[&str]) -> Result<Self> {
        let arity = |n: usize| {
            if params.len() == n {
                Ok(())
            } else {
                Err(malformed(
                    op,
                    format!("expected {n} parameters, got {}", params.len()),
                ))
            }
        };

        let step = match op.trim() {
            "demosaic" => {
                arity(1)?;
                let phase = params[0]
                    .parse::<BayerPhase>()
                    .map_err(|err| malformed(op, err))?;
                ProcessingStep::Demosaic { phase }
            }
            "rescale" => {
                arity(2)?;
                ProcessingStep::Rescale {
                    in_max: parse_number(op, params[0])?,
                    out_max: parse_number(op, params[1])?,
                }
            }
            "gamma" | "gamma_encode" => {
                arity(2)?;
                ProcessingStep::GammaEncode {
                    gamma: parse_number(op, params[0])?,
                    max_val: parse_number(op, params[1])?,
                }
            }
            "white_balance" => {
                arity(3)?;
                ProcessingStep::WhiteBalance {
                    gains: [
                        parse_number(op, params[0])?,
                        parse_number(op, params[1])?,
                        parse_number(op, params[2])?,
                    ],
                }
            }
            "black_level" => {
                arity(1)?;
                ProcessingStep::BlackLevel {
                    offset: parse_number(op, params[0])?,
                }
            }
            other => return Err(malformed(other, "unknown operation")),
        };

        step.validate()?;
        Ok(step)
    }

    /// Reject parameters the operation cannot run with.
    pub fn validate(&self) -> Result<()> {
        let op = self.op();
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(malformed(op, format!("{name} must be positive, got {v}")))
            }
        };
        let non_negative = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(malformed(op, format!("{name} must be non-negative, got {v}")))
            }
        };

        match self {
            ProcessingStep::Demosaic { .. } | ProcessingStep::Custom(_) => Ok(()),
            ProcessingStep::Rescale { in_max, out_max } => {
                positive("in_max", *in_max)?;
                non_negative("out_max", *out_max)
            }
            ProcessingStep::GammaEncode { gamma, max_val } => {
                positive("gamma", *gamma)?;
                positive("max_val", *max_val)
            }
            ProcessingStep::WhiteBalance { gains } => {
                gains.iter().try_for_each(|g| non_negative("gain", *g))
            }
            ProcessingStep::BlackLevel { offset } => non_negative("offset", *offset),
        }
    }

    /// Run the step on `data`.
    pub fn apply(&self, data: ArrayD<f64>) -> Result<ArrayD<f64>> {
        match self {
            ProcessingStep::Demosaic { phase } => {
                let raw = data.into_dimensionality::<Ix2>()?;
                Ok(Bilinear.demosaic(raw.view(), *phase).into_dyn())
            }
            ProcessingStep::Rescale { in_max, out_max } => {
                let factor = out_max / in_max;
                Ok(data.mapv_into(|v| v * factor))
            }
            ProcessingStep::GammaEncode { gamma, max_val } => {
                Ok(data.mapv_into(|v| (v.max(0.0) / max_val).powf(*gamma) * max_val))
            }
            ProcessingStep::WhiteBalance { gains } => {
                if data.ndim() != 3 || data.shape()[2] != 3 {
                    return Err(Error::ShapeMismatch {
                        expected: vec![0, 0, 3],
                        found: data.shape().to_vec(),
                    });
                }
                let mut data = data;
                for (gain, mut plane) in gains.iter().zip(data.axis_iter_mut(Axis(2))) {
                    plane.mapv_inplace(|v| v * gain);
                }
                Ok(data)
            }
            ProcessingStep::BlackLevel { offset } => {
                Ok(data.mapv_into(|v| (v - offset).max(0.0)))
            }
            ProcessingStep::Custom(step) => (step.func)(data),
        }
    }
}

impl fmt::Display for ProcessingStep {
    /// The `op:arg,arg` form accepted by [`FromStr`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingStep::Demosaic { phase } => write!(f, "demosaic:{phase}"),
            ProcessingStep::Rescale { in_max, out_max } => {
                write!(f, "rescale:{in_max},{out_max}")
            }
            ProcessingStep::GammaEncode { gamma, max_val } => {
                write!(f, "gamma:{gamma},{max_val}")
            }
            ProcessingStep::WhiteBalance { gains: [r, g, b] } => {
                write!(f, "white_balance:{r},{g},{b}")
            }
            ProcessingStep::BlackLevel { offset } => write!(f, "black_level:{offset}"),
            ProcessingStep::Custom(step) => write!(f, "{}", step.name()),
        }
    }
}

impl FromStr for ProcessingStep {
    type Err = Error;

    /// Parse `op` or `op:arg,arg,...`, e.g. `rescale:1023,255`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((op, args)) => {
                let params: Vec<&str> = args.split(',').collect();
                Self::from_parts(op, &params)
            }
            None => Self::from_parts(s, &[]),
        }
    }
}

/// An ordered sequence of processing steps and an output width.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessingPipeline {
    steps: Vec<ProcessingStep>,
    depth: OutputDepth,
}

impl ProcessingPipeline {
    /// Build a pipeline, rejecting any step with unusable parameters.
    pub fn new(steps: Vec<ProcessingStep>, depth: OutputDepth) -> Result<Self> {
        for step in &steps {
            step.validate()?;
        }
        Ok(Self { steps, depth })
    }

    /// Build a pipeline from textual steps such as `["demosaic:rggb", "rescale:1023,255"]`.
    pub fn parse<S: AsRef<str>>(steps: &[S], depth: OutputDepth) -> Result<Self> {
        let steps = steps
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<ProcessingStep>>>()?;
        Self::new(steps, depth)
    }

    /// A pipeline with no steps that only casts, for inspecting raw output.
    pub fn null(depth: OutputDepth) -> Self {
        Self {
            steps: Vec::new(),
            depth,
        }
    }

    pub fn steps(&self) -> &[ProcessingStep] {
        &self.steps
    }

    pub fn depth(&self) -> OutputDepth {
        self.depth
    }

    pub fn set_depth(&mut self, depth: OutputDepth) {
        self.depth = depth;
    }

    pub fn push(&mut self, step: ProcessingStep) -> Result<()> {
        step.validate()?;
        self.steps.push(step);
        Ok(())
    }

    /// Thread `raw` through every step in order and cast the result.
    pub fn run(&self, raw: ArrayViewD<u16>) -> Result<OutputImage> {
        let mut data = raw.mapv(f64::from);
        for (index, step) in self.steps.iter().enumerate() {
            data = step.apply(data)?;
            trace!(index, step = %step, shape = ?data.shape(), "ran processing step");
        }
        Ok(OutputImage::cast(data, self.depth))
    }
}

impl Default for ProcessingPipeline {
    /// Demosaic GRBG, scale 10-bit to 8-bit, gamma encode for display.
    fn default() -> Self {
        Self {
            steps: vec![
                ProcessingStep::Demosaic {
                    phase: BayerPhase::Grbg,
                },
                ProcessingStep::Rescale {
                    in_max: DEFAULT_MAX_DN as f64,
                    out_max: 255.0,
                },
                ProcessingStep::GammaEncode {
                    gamma: 1.0 / 2.2,
                    max_val: 255.0,
                },
            ],
            depth: OutputDepth::U8,
        }
    }
}
