//! Sub-pixel resampling of single image planes.
//!
//! The lens model only needs "read this plane at a fractional position", so
//! that capability is a trait and the bicubic kernel is the stock
//! implementation.

use ndarray::{Array2, ArrayView2, Zip};

/// Reads a plane at fractional `(row, col)` positions.
///
/// Positions outside the pixel footprint `[-0.5, rows - 0.5) x [-0.5, cols - 0.5)`
/// read as 0.
pub trait Resample: Sync {
    fn sample(&self, plane: ArrayView2<f64>, row: f64, col: f64) -> f64;

    /// Build a new plane where each output pixel reads `plane` at the
    /// position `source(row, col)` returns for it.
    fn remap<F>(&self, plane: ArrayView2<f64>, source: F) -> Array2<f64>
    where
        F: Fn(usize, usize) -> (f64, f64) + Sync,
        Self: Sized,
    {
        let mut out = Array2::zeros(plane.dim());
        Zip::indexed(&mut out).par_for_each(|(row, col), value| {
            let (src_row, src_col) = source(row, col);
            *value = self.sample(plane, src_row, src_col);
        });
        out
    }
}

/// Catmull-Rom bicubic interpolation with edge-replicated neighbours.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bicubic;

/// Cubic convolution kernel with `a = -0.5` (Catmull-Rom).
#[inline]
fn cubic_kernel(x: f64) -> f64 {
    const A: f64 = -0.5;
    let x = x.abs();
    if x <= 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}

#[inline]
fn in_footprint(pos: f64, len: usize) -> bool {
    pos >= -0.5 && pos < len as f64 - 0.5
}

impl Resample for Bicubic {
    fn sample(&self, plane: ArrayView2<f64>, row: f64, col: f64) -> f64 {
        let (rows, cols) = plane.dim();
        if !in_footprint(row, rows) || !in_footprint(col, cols) {
            return 0.0;
        }

        let r0 = row.floor();
        let c0 = col.floor();
        let fr = row - r0;
        let fc = col - c0;
        let wr = [
            cubic_kernel(fr + 1.0),
            cubic_kernel(fr),
            cubic_kernel(fr - 1.0),
            cubic_kernel(fr - 2.0),
        ];
        let wc = [
            cubic_kernel(fc + 1.0),
            cubic_kernel(fc),
            cubic_kernel(fc - 1.0),
            cubic_kernel(fc - 2.0),
        ];

        let clamp = |i: f64, len: usize| i.clamp(0.0, (len - 1) as f64) as usize;
        let mut sum = 0.0;
        for (j, w_row) in wr.iter().enumerate() {
            let r = clamp(r0 - 1.0 + j as f64, rows);
            for (i, w_col) in wc.iter().enumerate() {
                let c = clamp(c0 - 1.0 + i as f64, cols);
                sum += plane[[r, c]] * w_row * w_col;
            }
        }
        sum
    }
}
