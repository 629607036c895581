//! Radiometric sensor model: quantum efficiency, Bayer mosaicking, shot
//! noise, dark current, PRNU, gain, well capacity and ADC quantization.

use ndarray::{Array2, Array3, ArrayD, ArrayView3, Axis, Zip};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Poisson};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;
use uom::si::{f64::Time, time::second};

use crate::{
    bayer::{BayerPhase, mosaic},
    error::{Error, Result},
};

/// Full scale of a 10-bit ADC.
pub const DEFAULT_MAX_DN: u16 = 1023;

/// Rows of the sensor that share one random stream during shot noise.
const ROWS_PER_CHUNK: usize = 64;

/// Additive electron count present in every exposure.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NoiseFloor {
    Uniform(f64),
    PerPixel(Array2<f64>),
}

impl NoiseFloor {
    #[inline]
    fn at(&self, row: usize, col: usize) -> f64 {
        match self {
            NoiseFloor::Uniform(e) => *e,
            NoiseFloor::PerPixel(mask) => mask[[row, col]],
        }
    }
}

impl Default for NoiseFloor {
    fn default() -> Self {
        NoiseFloor::Uniform(0.0)
    }
}

/// Construction parameters for a [`RadiometricSensor`].
///
/// `None` masks mean a uniform sensor: PRNU of one and no dark current.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorParams {
    /// Multiplicative per-pixel response, `(H, W)`.
    pub prnu: Option<Array2<f64>>,
    /// Dark current in electrons per second, `(H, W)`.
    pub dark_current: Option<Array2<f64>>,
    /// Additive noise floor in electrons.
    pub noise_floor: NoiseFloor,
    /// Quantum efficiency for red, green and blue.
    pub qe: [f64; 3],
    /// Digital numbers per electron.
    pub gain: f64,
    /// Black level in digital numbers.
    pub offset: f64,
    /// Full well in electrons. `None` never saturates.
    pub well_capacity: Option<f64>,
    /// ADC ceiling in digital numbers, at most 65535.
    pub max_dn: u32,
    pub phase: BayerPhase,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            prnu: None,
            dark_current: None,
            noise_floor: NoiseFloor::default(),
            qe: [1.0; 3],
            gain: 1.0,
            offset: 0.0,
            well_capacity: None,
            max_dn: DEFAULT_MAX_DN as u32,
            phase: BayerPhase::default(),
        }
    }
}

/// A fixed-size photosensitive array behind a Bayer filter.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RadiometricSensor {
    rows: usize,
    cols: usize,
    prnu: Array2<f64>,
    dark_current: Array2<f64>,
    noise_floor: NoiseFloor,
    qe: [f64; 3],
    gain: f64,
    offset: f64,
    well_capacity: Option<f64>,
    max_dn: u16,
    phase: BayerPhase,
}

fn check_mask(name: &'static str, mask: &Array2<f64>, dim: (usize, usize)) -> Result<()> {
    if mask.dim() != dim {
        return Err(Error::parameter(
            name,
            format!("mask is {:?}, sensor is {:?}", mask.dim(), dim),
        ));
    }
    if mask.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(Error::parameter(name, "mask values must be finite and non-negative"));
    }
    Ok(())
}

fn check_non_negative(name: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::parameter(name, format!("{value} must be finite and non-negative")));
    }
    Ok(())
}

impl RadiometricSensor {
    /// A noiseless, unity-gain 10-bit GRBG sensor of `rows x cols`.
    pub fn with_size(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            prnu: Array2::ones((rows, cols)),
            dark_current: Array2::zeros((rows, cols)),
            noise_floor: NoiseFloor::default(),
            qe: [1.0; 3],
            gain: 1.0,
            offset: 0.0,
            well_capacity: None,
            max_dn: DEFAULT_MAX_DN,
            phase: BayerPhase::default(),
        }
    }

    pub fn new(rows: usize, cols: usize, params: SensorParams) -> Result<Self> {
        let mut sensor = Self::with_size(rows, cols);
        if let Some(prnu) = params.prnu {
            sensor.set_prnu(prnu)?;
        }
        if let Some(dark_current) = params.dark_current {
            sensor.set_dark_current(dark_current)?;
        }
        sensor.set_noise_floor(params.noise_floor)?;
        sensor.set_qe(params.qe)?;
        sensor.set_gain(params.gain)?;
        sensor.set_offset(params.offset)?;
        sensor.set_well_capacity(params.well_capacity)?;
        sensor.set_max_dn(params.max_dn)?;
        sensor.set_phase(params.phase);

        debug!(
            rows,
            cols,
            gain = sensor.gain,
            max_dn = sensor.max_dn,
            phase = %sensor.phase,
            "built radiometric sensor"
        );
        Ok(sensor)
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn prnu(&self) -> &Array2<f64> {
        &self.prnu
    }

    pub fn dark_current(&self) -> &Array2<f64> {
        &self.dark_current
    }

    pub fn noise_floor(&self) -> &NoiseFloor {
        &self.noise_floor
    }

    pub fn qe(&self) -> [f64; 3] {
        self.qe
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn well_capacity(&self) -> Option<f64> {
        self.well_capacity
    }

    pub fn max_dn(&self) -> u16 {
        self.max_dn
    }

    pub fn phase(&self) -> BayerPhase {
        self.phase
    }

    pub fn set_prnu(&mut self, prnu: Array2<f64>) -> Result<()> {
        check_mask("prnu", &prnu, self.dim())?;
        self.prnu = prnu;
        Ok(())
    }

    pub fn set_dark_current(&mut self, dark_current: Array2<f64>) -> Result<()> {
        check_mask("dark current", &dark_current, self.dim())?;
        self.dark_current = dark_current;
        Ok(())
    }

    pub fn set_noise_floor(&mut self, noise_floor: NoiseFloor) -> Result<()> {
        match &noise_floor {
            NoiseFloor::Uniform(e) => check_non_negative("noise floor", *e)?,
            NoiseFloor::PerPixel(mask) => check_mask("noise floor", mask, self.dim())?,
        }
        self.noise_floor = noise_floor;
        Ok(())
    }

    pub fn set_qe(&mut self, qe: [f64; 3]) -> Result<()> {
        for value in qe {
            check_non_negative("quantum efficiency", value)?;
        }
        self.qe = qe;
        Ok(())
    }

    pub fn set_gain(&mut self, gain: f64) -> Result<()> {
        if !gain.is_finite() || gain <= 0.0 {
            return Err(Error::parameter("gain", format!("{gain} must be greater than zero")));
        }
        self.gain = gain;
        Ok(())
    }

    pub fn set_offset(&mut self, offset: f64) -> Result<()> {
        if !offset.is_finite() {
            return Err(Error::parameter("offset", "must be finite"));
        }
        self.offset = offset;
        Ok(())
    }

    pub fn set_well_capacity(&mut self, well_capacity: Option<f64>) -> Result<()> {
        if let Some(capacity) = well_capacity {
            check_non_negative("well capacity", capacity)?;
        }
        self.well_capacity = well_capacity;
        Ok(())
    }

    pub fn set_max_dn(&mut self, max_dn: u32) -> Result<()> {
        self.max_dn = u16::try_from(max_dn)
            .ok()
            .filter(|dn| *dn > 0)
            .ok_or_else(|| Error::parameter("max dn", format!("{max_dn} is outside 1..=65535")))?;
        Ok(())
    }

    pub fn set_phase(&mut self, phase: BayerPhase) {
        self.phase = phase;
    }

    /// Expected electron count of every pixel for an exposure of `seconds`.
    fn expected_electrons(&self, radiance: ArrayView3<f64>, seconds: f64) -> Array2<f64> {
        let mut scaled: Array3<f64> = radiance.to_owned();
        for (qe, mut plane) in self.qe.iter().zip(scaled.axis_iter_mut(Axis(2))) {
            plane *= *qe;
        }

        let mut electrons = mosaic(scaled.view(), self.phase);
        Zip::indexed(&mut electrons)
            .and(&self.dark_current)
            .par_for_each(|(row, col), e, dark| {
                *e = (*e + dark) * seconds + self.noise_floor.at(row, col);
            });
        electrons
    }

    /// Convert saturated electron counts to digital numbers.
    fn digitize(&self, electrons: &Array2<f64>) -> Array2<u16> {
        let well = self.well_capacity.unwrap_or(f64::INFINITY);
        Zip::from(electrons)
            .and(&self.prnu)
            .par_map_collect(|e, prnu| {
                let e = e.min(well);
                quantize(self.gain * e * prnu + self.offset, self.max_dn)
            })
    }

    /// Expose the sensor to `radiance`, a `(H, W, 3)` array of photons per
    /// second, for `exposure`.
    ///
    /// Shot noise is the only random step; it draws from `rng`.
    pub fn expose_at<R: Rng + ?Sized>(
        &self,
        radiance: ArrayView3<f64>,
        exposure: Time,
        rng: &mut R,
    ) -> Result<Array2<u16>> {
        let (rows, cols, channels) = radiance.dim();
        if (rows, cols, channels) != (self.rows, self.cols, 3) {
            return Err(Error::ShapeMismatch {
                expected: vec![self.rows, self.cols, 3],
                found: radiance.shape().to_vec(),
            });
        }

        let expected = self.expected_electrons(radiance, exposure.get::<second>());
        let electrons = shot_noise(expected, rng.next_u64());
        Ok(self.digitize(&electrons))
    }
}

/// Round to the nearest integer, ties to even, and clamp into `[0, max_dn]`.
#[inline]
fn quantize(value: f64, max_dn: u16) -> u16 {
    value.round_ties_even().clamp(0.0, max_dn as f64) as u16
}

/// One Poisson draw with mean `lambda`.
#[inline]
fn poisson<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> f64 {
    if lambda.is_nan() || lambda <= 0.0 {
        return 0.0;
    }
    match Poisson::new(lambda) {
        Ok(dist) => dist.sample(rng),
        // Only means beyond the sampler's range land here.
        Err(_) => lambda,
    }
}

/// Replace every expected count with a Poisson sample of it.
///
/// Rows are processed in parallel chunks, each with a generator seeded from
/// `seed` plus the chunk index, so results do not depend on thread count.
fn shot_noise(mut electrons: Array2<f64>, seed: u64) -> Array2<f64> {
    electrons
        .axis_chunks_iter_mut(Axis(0), ROWS_PER_CHUNK)
        .into_par_iter()
        .enumerate()
        .for_each(|(chunk_idx, mut chunk)| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(chunk_idx as u64));
            chunk.map_inplace(|e| *e = poisson(*e, &mut rng));
        });
    electrons
}

/// The sensor stage of a camera.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Sensor {
    Radiometric(RadiometricSensor),
    /// Mosaics and rounds; no noise and no gain.
    PassThroughMosaic { phase: BayerPhase },
    /// Rounds each channel; the output stays `(H, W, 3)`.
    PassThroughRgb,
}

impl Sensor {
    /// Expose the sensor. Pass-through variants ignore `exposure` and `rng`.
    pub fn expose_at<R: Rng + ?Sized>(
        &self,
        radiance: ArrayView3<f64>,
        exposure: Time,
        rng: &mut R,
    ) -> Result<ArrayD<u16>> {
        match self {
            Sensor::Radiometric(sensor) => Ok(sensor.expose_at(radiance, exposure, rng)?.into_dyn()),
            Sensor::PassThroughMosaic { phase } => Ok(mosaic(radiance, *phase)
                .mapv(|v| quantize(v, u16::MAX))
                .into_dyn()),
            Sensor::PassThroughRgb => Ok(radiance.mapv(|v| quantize(v, u16::MAX)).into_dyn()),
        }
    }

    pub fn max_dn(&self) -> u16 {
        match self {
            Sensor::Radiometric(sensor) => sensor.max_dn(),
            _ => DEFAULT_MAX_DN,
        }
    }

    pub fn gain(&self) -> f64 {
        match self {
            Sensor::Radiometric(sensor) => sensor.gain(),
            _ => 1.0,
        }
    }

    pub fn qe(&self) -> [f64; 3] {
        match self {
            Sensor::Radiometric(sensor) => sensor.qe(),
            _ => [1.0; 3],
        }
    }
}

impl From<RadiometricSensor> for Sensor {
    fn from(sensor: RadiometricSensor) -> Self {
        Sensor::Radiometric(sensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    const SIZE: usize = 64;

    fn seconds(s: f64) -> Time {
        Time::new::<second>(s)
    }

    fn rgb(color: [f64; 3]) -> Array3<f64> {
        Array3::from_shape_fn((SIZE, SIZE, 3), |(_, _, c)| color[c])
    }

    fn sensor(params: SensorParams) -> RadiometricSensor {
        RadiometricSensor::new(SIZE, SIZE, params).unwrap()
    }

    fn site_mean(raw: &Array2<u16>, phase: BayerPhase, channel: usize) -> f64 {
        let values: Vec<f64> = raw
            .indexed_iter()
            .filter(|((r, c), _)| phase.channel_at(*r, *c).index() == channel)
            .map(|(_, v)| *v as f64)
            .collect();
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn mean_output_matches_mosaicked_power() {
        let qe = 0.5;
        let sensor = sensor(SensorParams {
            qe: [qe; 3],
            ..SensorParams::default()
        });
        let mut rng = StdRng::seed_from_u64(7);
        let raw = sensor
            .expose_at(rgb([30.0, 60.0, 90.0]).view(), seconds(1.0 / qe), &mut rng)
            .unwrap();

        let phase = sensor.phase();
        assert_abs_diff_eq!(site_mean(&raw, phase, 0), 30.0, epsilon = 1.0);
        assert_abs_diff_eq!(site_mean(&raw, phase, 1), 60.0, epsilon = 1.0);
        assert_abs_diff_eq!(site_mean(&raw, phase, 2), 90.0, epsilon = 1.5);
    }

    #[test]
    fn shot_noise_has_poisson_variance() {
        let sensor = sensor(SensorParams::default());
        let mut rng = StdRng::seed_from_u64(11);
        let raw = sensor
            .expose_at(rgb([100.0; 3]).view(), seconds(1.0), &mut rng)
            .unwrap();
        let n = raw.len() as f64;
        let mean = raw.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = raw.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert_abs_diff_eq!(var, 100.0, epsilon = 10.0);
    }

    #[rstest]
    #[case(1.5, 10.0, 1023, 760)]
    #[case(3.0, 10.0, 1023, 1023)]
    #[case(1.0, 0.0, 255, 255)]
    #[case(0.5, 4.0, 4095, 254)]
    fn saturation_takes_the_lower_ceiling(
        #[case] gain: f64,
        #[case] offset: f64,
        #[case] max_dn: u32,
        #[case] expected: u16,
    ) {
        let sensor = sensor(SensorParams {
            gain,
            offset,
            max_dn,
            well_capacity: Some(500.0),
            ..SensorParams::default()
        });
        let mut rng = StdRng::seed_from_u64(3);
        let raw = sensor
            .expose_at(rgb([1e6; 3]).view(), seconds(1.0), &mut rng)
            .unwrap();
        assert!(raw.iter().all(|v| *v == expected));
    }

    #[test]
    fn adc_ceiling_binds_without_well() {
        let sensor = sensor(SensorParams::default());
        let mut rng = StdRng::seed_from_u64(5);
        let raw = sensor
            .expose_at(rgb([1e5; 3]).view(), seconds(1.0), &mut rng)
            .unwrap();
        assert!(raw.iter().all(|v| *v == DEFAULT_MAX_DN));
    }

    #[test]
    fn prnu_scales_after_saturation() {
        let mut prnu = Array2::ones((SIZE, SIZE));
        prnu[[0, 0]] = 0.5;
        let sensor = sensor(SensorParams {
            prnu: Some(prnu),
            well_capacity: Some(100.0),
            ..SensorParams::default()
        });
        let mut rng = StdRng::seed_from_u64(1);
        let raw = sensor
            .expose_at(rgb([1e6; 3]).view(), seconds(1.0), &mut rng)
            .unwrap();
        assert_eq!(raw[[0, 0]], 50);
        assert_eq!(raw[[0, 1]], 100);
    }

    #[test]
    fn dark_current_and_floor_add_electrons() {
        let sensor = sensor(SensorParams {
            dark_current: Some(Array2::from_elem((SIZE, SIZE), 5.0)),
            noise_floor: NoiseFloor::Uniform(3.0),
            offset: 20.0,
            ..SensorParams::default()
        });
        let mut rng = StdRng::seed_from_u64(9);
        let raw = sensor
            .expose_at(rgb([0.0; 3]).view(), seconds(2.0), &mut rng)
            .unwrap();
        let mean = raw.iter().map(|v| *v as f64).sum::<f64>() / raw.len() as f64;
        assert_abs_diff_eq!(mean, 20.0 + 13.0, epsilon = 0.5);
    }

    #[test]
    fn per_pixel_noise_floor_follows_mask() {
        let floor = Array2::from_shape_fn((SIZE, SIZE), |(_, c)| {
            if c < SIZE / 2 { 100.0 } else { 400.0 }
        });
        let sensor = sensor(SensorParams {
            noise_floor: NoiseFloor::PerPixel(floor),
            ..SensorParams::default()
        });
        let mut rng = StdRng::seed_from_u64(13);
        let raw = sensor
            .expose_at(rgb([0.0; 3]).view(), seconds(1.0), &mut rng)
            .unwrap();

        let region_mean = |cols: std::ops::Range<usize>| {
            let region = raw.slice(ndarray::s![.., cols]);
            region.iter().map(|v| *v as f64).sum::<f64>() / region.len() as f64
        };
        assert_abs_diff_eq!(region_mean(0..SIZE / 2), 100.0, epsilon = 2.0);
        assert_abs_diff_eq!(region_mean(SIZE / 2..SIZE), 400.0, epsilon = 4.0);
    }

    #[test]
    fn dark_frame_reads_black_level() {
        let sensor = sensor(SensorParams {
            offset: 64.0,
            ..SensorParams::default()
        });
        let mut rng = StdRng::seed_from_u64(2);
        let raw = sensor
            .expose_at(rgb([0.0; 3]).view(), seconds(1.0), &mut rng)
            .unwrap();
        assert!(raw.iter().all(|v| *v == 64));
    }

    #[test]
    fn same_seed_same_frame() {
        let sensor = sensor(SensorParams::default());
        let scene = rgb([40.0, 50.0, 60.0]);
        let a = sensor
            .expose_at(scene.view(), seconds(1.0), &mut StdRng::seed_from_u64(42))
            .unwrap();
        let b = sensor
            .expose_at(scene.view(), seconds(1.0), &mut StdRng::seed_from_u64(42))
            .unwrap();
        let c = sensor
            .expose_at(scene.view(), seconds(1.0), &mut StdRng::seed_from_u64(43))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_mismatched_scene() {
        let sensor = sensor(SensorParams::default());
        let scene = Array3::zeros((SIZE, SIZE + 1, 3));
        let result = sensor.expose_at(scene.view(), seconds(1.0), &mut StdRng::seed_from_u64(0));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[rstest]
    #[case(SensorParams { gain: 0.0, ..SensorParams::default() }, "gain")]
    #[case(SensorParams { gain: -2.0, ..SensorParams::default() }, "gain")]
    #[case(SensorParams { max_dn: 65536, ..SensorParams::default() }, "max dn")]
    #[case(SensorParams { max_dn: 0, ..SensorParams::default() }, "max dn")]
    #[case(SensorParams { qe: [1.0, -0.1, 1.0], ..SensorParams::default() }, "quantum efficiency")]
    #[case(SensorParams { prnu: Some(Array2::ones((2, 2))), ..SensorParams::default() }, "prnu")]
    #[case(SensorParams { well_capacity: Some(f64::NAN), ..SensorParams::default() }, "well capacity")]
    #[case(SensorParams { noise_floor: NoiseFloor::PerPixel(Array2::zeros((SIZE, 3))), ..SensorParams::default() }, "noise floor")]
    #[case(SensorParams { noise_floor: NoiseFloor::Uniform(-1.0), ..SensorParams::default() }, "noise floor")]
    fn rejects_invalid_parameters(#[case] params: SensorParams, #[case] field: &str) {
        match RadiometricSensor::new(SIZE, SIZE, params) {
            Err(Error::InvalidParameter { name, .. }) => assert_eq!(name, field),
            other => panic!("expected invalid {field}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_sixteen_bit_ceiling() {
        let sensor = sensor(SensorParams {
            max_dn: 65535,
            ..SensorParams::default()
        });
        assert_eq!(sensor.max_dn(), u16::MAX);
    }

    #[rstest]
    #[case(0.5, 0)]
    #[case(1.5, 2)]
    #[case(2.5, 2)]
    #[case(-3.0, 0)]
    #[case(2000.0, 1023)]
    fn quantizes_ties_to_even_and_clamps(#[case] value: f64, #[case] expected: u16) {
        assert_eq!(quantize(value, 1023), expected);
    }

    #[test]
    fn pass_through_mosaic_rounds_only() {
        let scene = rgb([1.4, 2.6, 3.5]);
        let raw = Sensor::PassThroughMosaic {
            phase: BayerPhase::Rggb,
        }
        .expose_at(scene.view(), seconds(123.0), &mut StdRng::seed_from_u64(0))
        .unwrap();
        assert_eq!(raw.shape(), &[SIZE, SIZE]);
        assert_eq!(raw[[0, 0]], 1);
        assert_eq!(raw[[0, 1]], 3);
        assert_eq!(raw[[1, 1]], 4);
    }

    #[test]
    fn pass_through_rgb_keeps_channels() {
        let scene = rgb([1.4, 2.6, 70000.0]);
        let raw = Sensor::PassThroughRgb
            .expose_at(scene.view(), seconds(0.0), &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(raw.shape(), &[SIZE, SIZE, 3]);
        assert_eq!(raw[[3, 4, 0]], 1);
        assert_eq!(raw[[3, 4, 1]], 3);
        assert_eq!(raw[[3, 4, 2]], u16::MAX);
    }
}
