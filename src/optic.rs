//! Lens optics: radial distortion, lateral chromatic aberration, optical
//! center offset and veiling glare.

use ndarray::{Array3, ArrayView2, ArrayView3, Axis, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    curve::{DISTORTION_INVERSE_SAMPLES, LCA_INVERSE_SAMPLES, PolynomialCurve},
    error::{Error, Result},
    resample::{Bicubic, Resample},
};

/// Construction parameters for an [`OpticalDistortionModel`].
///
/// Curve coefficients are ordered highest degree first and must have 4 or 6
/// entries. The LCA curves are relative displacements of the red and blue
/// channels against green.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LensParams {
    pub distortion: Vec<f64>,
    pub lca_red: Vec<f64>,
    pub lca_blue: Vec<f64>,
    /// Optical center offset in pixels as `(dx, dy)`.
    pub offset: (f64, f64),
    pub flare: f64,
}

impl Default for LensParams {
    fn default() -> Self {
        Self {
            distortion: PolynomialCurve::identity().coefficients().to_vec(),
            lca_red: PolynomialCurve::zero().coefficients().to_vec(),
            lca_blue: PolynomialCurve::zero().coefficients().to_vec(),
            offset: (0.0, 0.0),
            flare: 0.0,
        }
    }
}

/// Geometric and veiling-glare model of a lens.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OpticalDistortionModel {
    distortion: PolynomialCurve,
    lca_red: PolynomialCurve,
    lca_blue: PolynomialCurve,
    offset: (f64, f64),
    flare: f64,
}

impl TryFrom<LensParams> for OpticalDistortionModel {
    type Error = Error;

    fn try_from(params: LensParams) -> Result<Self> {
        Self::new(
            PolynomialCurve::new(params.distortion)?,
            PolynomialCurve::new(params.lca_red)?,
            PolynomialCurve::new(params.lca_blue)?,
            params.offset,
            params.flare,
        )
    }
}

impl Default for OpticalDistortionModel {
    fn default() -> Self {
        Self {
            distortion: PolynomialCurve::identity(),
            lca_red: PolynomialCurve::zero(),
            lca_blue: PolynomialCurve::zero(),
            offset: (0.0, 0.0),
            flare: 0.0,
        }
    }
}

/// Per-pixel polar coordinates, normalized so the farthest corner of the
/// centered grid sits at radius 1.
struct PolarGrid {
    center: (f64, f64),
    half_diagonal: f64,
}

impl PolarGrid {
    /// `offset` moves the optical center toward the lower left for positive
    /// values: left along columns, down along rows.
    fn new(rows: usize, cols: usize, offset: (f64, f64)) -> Self {
        let cy = (rows.saturating_sub(1)) as f64 / 2.0;
        let cx = (cols.saturating_sub(1)) as f64 / 2.0;
        let half_diagonal = cx.hypot(cy);
        Self {
            center: (cy + offset.1, cx - offset.0),
            half_diagonal: if half_diagonal > 0.0 { half_diagonal } else { 1.0 },
        }
    }

    /// `(theta, radius)` of pixel `(row, col)`.
    fn to_polar(&self, row: usize, col: usize) -> (f64, f64) {
        let y = row as f64 - self.center.0;
        let x = col as f64 - self.center.1;
        (y.atan2(x), x.hypot(y) / self.half_diagonal)
    }

    /// `(row, col)` of a polar position.
    fn to_pixel(&self, theta: f64, radius: f64) -> (f64, f64) {
        let r = radius * self.half_diagonal;
        (self.center.0 + r * theta.sin(), self.center.1 + r * theta.cos())
    }
}

impl OpticalDistortionModel {
    pub fn new(
        distortion: PolynomialCurve,
        lca_red: PolynomialCurve,
        lca_blue: PolynomialCurve,
        offset: (f64, f64),
        flare: f64,
    ) -> Result<Self> {
        let mut model = Self {
            distortion,
            lca_red,
            lca_blue,
            offset: (0.0, 0.0),
            flare: 0.0,
        };
        model.set_offset(offset)?;
        model.set_flare(flare)?;
        debug!(?model, "built optical distortion model");
        Ok(model)
    }

    pub fn distortion(&self) -> &PolynomialCurve {
        &self.distortion
    }

    pub fn lca_red(&self) -> &PolynomialCurve {
        &self.lca_red
    }

    pub fn lca_blue(&self) -> &PolynomialCurve {
        &self.lca_blue
    }

    pub fn offset(&self) -> (f64, f64) {
        self.offset
    }

    pub fn flare(&self) -> f64 {
        self.flare
    }

    pub fn set_distortion(&mut self, curve: PolynomialCurve) {
        self.distortion = curve;
    }

    pub fn set_lca(&mut self, red: PolynomialCurve, blue: PolynomialCurve) {
        self.lca_red = red;
        self.lca_blue = blue;
    }

    pub fn set_offset(&mut self, offset: (f64, f64)) -> Result<()> {
        if !(offset.0.is_finite() && offset.1.is_finite()) {
            return Err(Error::parameter("optical center offset", "must be finite"));
        }
        self.offset = offset;
        Ok(())
    }

    pub fn set_flare(&mut self, flare: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&flare) {
            return Err(Error::parameter("flare", format!("{flare} is outside [0, 1]")));
        }
        self.flare = flare;
        Ok(())
    }

    /// Distort a `(H, W, 3)` radiance image with the stock bicubic resampler.
    pub fn apply(&self, image: ArrayView3<f64>) -> Array3<f64> {
        self.apply_with(image, &Bicubic)
    }

    /// Distort a `(H, W, 3)` radiance image.
    ///
    /// Green is resampled through the inverted distortion curve; red and blue
    /// are then displaced relative to green through their inverted LCA
    /// curves. Flare is applied last.
    ///
    /// With an offset center some pixels sit past radius 1; the fitted
    /// curves are extrapolated there, and sources outside the frame read 0.
    pub fn apply_with<R: Resample>(&self, image: ArrayView3<f64>, resampler: &R) -> Array3<f64> {
        let (rows, cols, _) = image.dim();
        let grid = PolarGrid::new(rows, cols, self.offset);

        let inv_distortion = self.distortion.invert(DISTORTION_INVERSE_SAMPLES);
        let inv_red = self.lca_red.to_absolute().invert(LCA_INVERSE_SAMPLES);
        let inv_blue = self.lca_blue.to_absolute().invert(LCA_INVERSE_SAMPLES);

        // Scaling by f(1) is what pins the corners: radius 1 lands on
        // inv(f(1)), which is 1, for any curve.
        let corner_scale = self.distortion.evaluate(1.0);

        let green_radius = |row: usize, col: usize| {
            let (theta, radius) = grid.to_polar(row, col);
            (theta, inv_distortion.evaluate(radius * corner_scale))
        };

        let resample_channel = |channel: usize, lca: Option<&PolynomialCurve>| {
            let plane: ArrayView2<f64> = image.index_axis(Axis(2), channel);
            resampler.remap(plane, |row, col| {
                let (theta, radius) = green_radius(row, col);
                let radius = lca.map_or(radius, |curve| curve.evaluate(radius));
                grid.to_pixel(theta, radius)
            })
        };

        let mut out = Array3::zeros((rows, cols, 3));
        out.index_axis_mut(Axis(2), 0)
            .assign(&resample_channel(0, Some(&inv_red)));
        out.index_axis_mut(Axis(2), 1)
            .assign(&resample_channel(1, None));
        out.index_axis_mut(Axis(2), 2)
            .assign(&resample_channel(2, Some(&inv_blue)));

        self.apply_flare(&mut out);
        out
    }

    /// Each pixel loses a `flare` fraction of its value; the channel's RMS
    /// times `flare` is added back uniformly.
    ///
    /// RMS rather than the mean is the redistributed magnitude, so the total
    /// signal is not exactly conserved.
    fn apply_flare(&self, image: &mut Array3<f64>) {
        if self.flare == 0.0 {
            return;
        }

        for mut plane in image.axis_iter_mut(Axis(2)) {
            let count = plane.len().max(1) as f64;
            let l2 = plane.iter().map(|v| v * v).sum::<f64>().sqrt();
            let veil = self.flare * l2 / count.sqrt();
            let keep = 1.0 - self.flare;
            Zip::from(&mut plane).par_for_each(|v| *v = *v * keep + veil);
        }
    }
}

/// The optics stage of a camera.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Lens {
    Distorting(OpticalDistortionModel),
    /// Passes radiance through untouched.
    PassThrough,
}

impl Lens {
    pub fn apply(&self, scene: ArrayView3<f64>) -> Array3<f64> {
        match self {
            Lens::Distorting(model) => model.apply(scene),
            Lens::PassThrough => scene.to_owned(),
        }
    }
}

impl Default for Lens {
    fn default() -> Self {
        Lens::Distorting(OpticalDistortionModel::default())
    }
}

impl From<OpticalDistortionModel> for Lens {
    fn from(model: OpticalDistortionModel) -> Self {
        Lens::Distorting(model)
    }
}
