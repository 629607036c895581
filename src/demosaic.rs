//! Reconstruction of RGB images from Bayer mosaics.

use ndarray::{Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::bayer::{BayerPhase, Channel};

/// Turns single-channel Bayer data into a `(H, W, 3)` color image.
pub trait Demosaic: Sync {
    fn demosaic(&self, raw: ArrayView2<f64>, phase: BayerPhase) -> Array3<f64>;
}

/// Bilinear demosaicing.
///
/// Each missing channel is the mean of the same-colored sites in the 3x3
/// neighbourhood; sites that fall off the image are skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bilinear;

impl Bilinear {
    fn neighbourhood_mean(
        raw: ArrayView2<f64>,
        phase: BayerPhase,
        row: usize,
        col: usize,
        channel: Channel,
    ) -> f64 {
        let (rows, cols) = raw.dim();
        let mut sum = 0.0;
        let mut count = 0usize;

        for r in row.saturating_sub(1)..=(row + 1).min(rows - 1) {
            for c in col.saturating_sub(1)..=(col + 1).min(cols - 1) {
                if (r, c) != (row, col) && phase.channel_at(r, c) == channel {
                    sum += raw[[r, c]];
                    count += 1;
                }
            }
        }

        // Only 1-pixel-wide images can have no neighbour of a color.
        if count == 0 { 0.0 } else { sum / count as f64 }
    }
}

impl Demosaic for Bilinear {
    fn demosaic(&self, raw: ArrayView2<f64>, phase: BayerPhase) -> Array3<f64> {
        let (rows, cols) = raw.dim();
        let mut rgb = Array3::zeros((rows, cols, 3));

        rgb.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut line)| {
                for col in 0..cols {
                    let site = phase.channel_at(row, col);
                    for channel in [Channel::Red, Channel::Green, Channel::Blue] {
                        line[[col, channel.index()]] = if channel == site {
                            raw[[row, col]]
                        } else {
                            Self::neighbourhood_mean(raw, phase, row, col, channel)
                        };
                    }
                }
            });

        rgb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bayer::mosaic;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rstest::rstest;

    #[rstest]
    #[case(BayerPhase::Grbg)]
    #[case(BayerPhase::Bggr)]
    #[case(BayerPhase::Rggb)]
    #[case(BayerPhase::Gbrg)]
    fn flat_color_survives_round_trip(#[case] phase: BayerPhase) {
        let color = [40.0, 80.0, 20.0];
        let rgb = Array3::from_shape_fn((6, 7, 3), |(_, _, c)| color[c]);

        let restored = Bilinear.demosaic(mosaic(rgb.view(), phase).view(), phase);

        assert_eq!(restored.dim(), (6, 7, 3));
        for ((_, _, c), v) in restored.indexed_iter() {
            assert_abs_diff_eq!(*v, color[c], epsilon = 1e-12);
        }
    }

    #[test]
    fn keeps_measured_sites() {
        let raw = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        let rgb = Bilinear.demosaic(raw.view(), BayerPhase::Rggb);
        assert_eq!(rgb[[0, 0, 0]], 0.0);
        assert_eq!(rgb[[0, 1, 1]], 1.0);
        assert_eq!(rgb[[1, 1, 2]], 5.0);
    }

    #[test]
    fn interpolates_green_at_red_sites_from_cross() {
        let raw = Array2::from_shape_fn((5, 5), |(r, c)| (r * 5 + c) as f64);
        let rgb = Bilinear.demosaic(raw.view(), BayerPhase::Rggb);
        // (2, 2) is red; its green neighbours are 7, 11, 13, 17.
        assert_abs_diff_eq!(rgb[[2, 2, 1]], 12.0);
        // Its blue neighbours are the diagonals 6, 8, 16, 18.
        assert_abs_diff_eq!(rgb[[2, 2, 2]], 12.0);
    }
}
