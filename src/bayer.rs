//! Bayer color filter array phases and mosaicking.

use std::{fmt, str::FromStr};

use ndarray::{Array2, ArrayView3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A color channel of an RGB image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

impl Channel {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Layout of the repeating 2x2 Bayer tile, named by reading the tile in row
/// major order.
///
/// ```text
/// grbg:  G R    bggr:  B G    rggb:  R G    gbrg:  G B
///        B G           G R           G B           R G
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BayerPhase {
    #[default]
    Grbg,
    Bggr,
    Rggb,
    Gbrg,
}

impl BayerPhase {
    /// The tile as `[row0_col0, row0_col1, row1_col0, row1_col1]`.
    pub fn tile(self) -> [Channel; 4] {
        use Channel::*;
        match self {
            BayerPhase::Grbg => [Green, Red, Blue, Green],
            BayerPhase::Bggr => [Blue, Green, Green, Red],
            BayerPhase::Rggb => [Red, Green, Green, Blue],
            BayerPhase::Gbrg => [Green, Blue, Red, Green],
        }
    }

    /// The channel that survives at pixel `(row, col)`.
    #[inline]
    pub fn channel_at(self, row: usize, col: usize) -> Channel {
        self.tile()[((row & 1) << 1) | (col & 1)]
    }
}

impl fmt::Display for BayerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BayerPhase::Grbg => "grbg",
            BayerPhase::Bggr => "bggr",
            BayerPhase::Rggb => "rggb",
            BayerPhase::Gbrg => "gbrg",
        })
    }
}

impl FromStr for BayerPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grbg" => Ok(BayerPhase::Grbg),
            "bggr" => Ok(BayerPhase::Bggr),
            "rggb" => Ok(BayerPhase::Rggb),
            "gbrg" => Ok(BayerPhase::Gbrg),
            other => Err(Error::InvalidArgument(format!(
                "unknown bayer phase `{other}`"
            ))),
        }
    }
}

/// Multiplex a `(H, W, 3)` image down to `(H, W)` by keeping, at each pixel,
/// only the channel the phase places there.
pub fn mosaic(rgb: ArrayView3<f64>, phase: BayerPhase) -> Array2<f64> {
    let (rows, cols, _) = rgb.dim();
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        rgb[[row, col, phase.channel_at(row, col).index()]]
    })
}
