//! Radial polynomial curves on the normalized radius domain `[0, 1]`.
//!
//! A radius of 1 is the distance from the image center to the farthest
//! corner. Curves are stored in the power basis with the highest degree
//! first, so `[a, b, c, d]` is `a·r³ + b·r² + c·r + d`.

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Degree of every inverse produced by [`PolynomialCurve::invert`].
const INVERSE_DEGREE: usize = 5;

/// Sample count used when inverting a distortion curve.
pub const DISTORTION_INVERSE_SAMPLES: usize = 10;

/// Sample count used when inverting a lateral chromatic aberration curve.
///
/// Relative displacement curves are noisier to invert than distortion curves.
pub const LCA_INVERSE_SAMPLES: usize = 50;

/// A degree 3 or degree 5 polynomial over the normalized radius.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PolynomialCurve {
    coeffs: Vec<f64>,
}

impl PolynomialCurve {
    /// Create a curve from coefficients ordered highest degree first.
    ///
    /// Returns an error unless there are exactly 4 (cubic) or 6 (quintic)
    /// coefficients.
    pub fn new(coeffs: impl Into<Vec<f64>>) -> Result<Self> {
        let coeffs = coeffs.into();
        match coeffs.len() {
            4 | 6 => Ok(Self { coeffs }),
            len => Err(Error::InvalidCoefficients { len }),
        }
    }

    /// The cubic `r ↦ r`.
    pub fn identity() -> Self {
        Self {
            coeffs: vec![0.0, 0.0, 1.0, 0.0],
        }
    }

    /// The cubic `r ↦ 0`, a relative displacement curve that displaces nothing.
    pub fn zero() -> Self {
        Self {
            coeffs: vec![0.0; 4],
        }
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    /// Evaluate the curve at `x` using Horner's scheme.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.coeffs.iter().fold(0.0, |acc, c| acc * x + c)
    }

    /// Convert a relative displacement curve into an absolute radius curve.
    ///
    /// A displacement of zero maps every radius onto itself, so the linear
    /// term gains 1.
    pub fn to_absolute(&self) -> Self {
        let mut coeffs = self.coeffs.clone();
        let linear = coeffs.len() - 2;
        coeffs[linear] += 1.0;
        Self { coeffs }
    }

    /// Approximate the inverse of this curve with a quintic.
    ///
    /// The forward curve is evaluated at `samples` evenly spaced radii in
    /// `[0, 1]` and a degree 5 polynomial is least-squares fit to the swapped
    /// `(output, input)` pairs. The result is only meaningful for curves that
    /// are monotonic on `[0, 1]`; nothing checks that.
    pub fn invert(&self, samples: usize) -> Self {
        let samples = samples.max(2);
        let (outputs, inputs): (Vec<f64>, Vec<f64>) = (0..samples)
            .map(|i| i as f64 / (samples - 1) as f64)
            .map(|x| (self.evaluate(x), x))
            .unzip();

        Self {
            coeffs: polyfit(&outputs, &inputs, INVERSE_DEGREE),
        }
    }
}

impl Default for PolynomialCurve {
    fn default() -> Self {
        Self::identity()
    }
}

/// Least-squares polynomial fit, coefficients returned highest degree first.
fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Vec<f64> {
    let ncols = degree + 1;
    let vandermonde = DMatrix::from_fn(xs.len(), ncols, |row, col| {
        xs[row].powi((degree - col) as i32)
    });
    let rhs = DVector::from_column_slice(ys);

    vandermonde
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map(|solution| solution.iter().copied().collect())
        .unwrap_or_else(|_| vec![0.0; ncols])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use quickcheck_macros::quickcheck;
    use rstest::rstest;

    fn grid(n: usize) -> impl Iterator<Item = f64> {
        (0..=n).map(move |i| i as f64 / n as f64)
    }

    #[rstest]
    #[case(3)]
    #[case(5)]
    #[case(7)]
    #[case(0)]
    fn rejects_bad_coefficient_counts(#[case] len: usize) {
        assert!(matches!(
            PolynomialCurve::new(vec![0.0; len]),
            Err(Error::InvalidCoefficients { len: l }) if l == len
        ));
    }

    #[rstest]
    #[case(vec![1.0, 2.0, 3.0, 4.0], 0.5, 0.125 + 0.5 + 1.5 + 4.0)]
    #[case(vec![0.0, 0.0, 1.0, 0.0], 0.3, 0.3)]
    #[case(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.5, 0.03125)]
    fn evaluates_power_basis(#[case] coeffs: Vec<f64>, #[case] x: f64, #[case] y: f64) {
        let curve = PolynomialCurve::new(coeffs).unwrap();
        assert_abs_diff_eq!(curve.evaluate(x), y, epsilon = 1e-12);
    }

    #[test]
    fn absolute_form_adds_one_to_linear_term() {
        let cubic = PolynomialCurve::new(vec![0.1, 0.2, 0.5, 0.4]).unwrap();
        assert_eq!(cubic.to_absolute().coefficients(), &[0.1, 0.2, 1.5, 0.4]);

        let quintic = PolynomialCurve::new(vec![0.0; 6]).unwrap();
        assert_eq!(
            quintic.to_absolute().coefficients(),
            &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
        assert_eq!(PolynomialCurve::zero().to_absolute(), PolynomialCurve::identity());
    }

    #[test]
    fn inverse_is_always_quintic() {
        let inverse = PolynomialCurve::identity().invert(DISTORTION_INVERSE_SAMPLES);
        assert_eq!(inverse.degree(), 5);
        for x in grid(20) {
            assert_abs_diff_eq!(inverse.evaluate(x), x, epsilon = 1e-9);
        }
    }

    #[rstest]
    #[case(vec![0.1, 0.0, 0.9, 0.0])]
    #[case(vec![-0.15, 0.05, 1.1, 0.0])]
    #[case(vec![0.0, 0.0, 1.2, 0.0])]
    fn inverse_undoes_forward_curve(#[case] coeffs: Vec<f64>) {
        let curve = PolynomialCurve::new(coeffs).unwrap();
        let inverse = curve.invert(DISTORTION_INVERSE_SAMPLES);
        for x in grid(20) {
            assert_abs_diff_eq!(inverse.evaluate(curve.evaluate(x)), x, epsilon = 5e-3);
        }
    }

    #[test]
    fn lca_inverse_is_accurate() {
        let lca = PolynomialCurve::new(vec![0.0, 0.01, -0.02, 0.0])
            .unwrap()
            .to_absolute();
        let worst = |samples| {
            let inverse = lca.invert(samples);
            grid(100)
                .map(|x| (inverse.evaluate(lca.evaluate(x)) - x).abs())
                .fold(0.0, f64::max)
        };
        assert!(worst(LCA_INVERSE_SAMPLES) < 1e-6);
    }

    fn double_inversion_error(curve: &PolynomialCurve) -> f64 {
        let inverse = curve.invert(DISTORTION_INVERSE_SAMPLES);
        let round_trip = inverse.invert(DISTORTION_INVERSE_SAMPLES);

        // The second fit only sees radii the first inverse reaches from [0, 1].
        let upper = inverse.evaluate(1.0).min(1.0);
        grid(20)
            .map(|x| x * upper)
            .map(|x| (round_trip.evaluate(x) - curve.evaluate(x)).abs())
            .fold(0.0, f64::max)
    }

    #[rstest]
    #[case(-0.1, 0.9)]
    #[case(-0.1, 1.1)]
    #[case(0.1, 0.9)]
    #[case(0.1, 1.1)]
    fn double_inversion_holds_at_range_limits(#[case] a: f64, #[case] c: f64) {
        let curve = PolynomialCurve::new(vec![a, 0.0, c, 0.0]).unwrap();
        assert!(double_inversion_error(&curve) < 1e-2);
    }

    #[quickcheck]
    fn double_inversion_approximates_original(cubic_seed: i16, linear_seed: i16) -> bool {
        // Mild lenses only: steeper curves are beyond what a quintic fit to
        // ten samples can invert to within a hundredth.
        let a = cubic_seed as f64 / i16::MAX as f64 * 0.1;
        let c = 1.0 + linear_seed as f64 / i16::MAX as f64 * 0.1;
        let curve = PolynomialCurve::new(vec![a, 0.0, c, 0.0]).unwrap();
        double_inversion_error(&curve) < 1e-2
    }
}
