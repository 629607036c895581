//! The camera: lens, sensor and processing pipeline composed into one
//! exposure simulation, plus automatic exposure time selection.

use std::{fmt, str::FromStr};

use chrono::Utc;
use ndarray::ArrayView3;
use rand::{Rng, SeedableRng, rngs::StdRng};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uom::si::{f64::Time, time::second};

use crate::{
    error::{Error, Result},
    optic::Lens,
    pipeline::{OutputImage, ProcessingPipeline},
    sensor::{RadiometricSensor, Sensor},
};

/// Scene statistic an exposure time is derived from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AutoExposureMode {
    /// Put the scene mean at half of the ADC range.
    #[default]
    GrayWorld,
    /// Put the scene maximum exactly at the ADC ceiling.
    Saturation,
}

impl fmt::Display for AutoExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AutoExposureMode::GrayWorld => "grayworld",
            AutoExposureMode::Saturation => "saturation",
        })
    }
}

impl FromStr for AutoExposureMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grayworld" => Ok(AutoExposureMode::GrayWorld),
            "saturation" => Ok(AutoExposureMode::Saturation),
            other => Err(Error::InvalidArgument(format!(
                "unknown auto exposure mode `{other}`"
            ))),
        }
    }
}

/// A lens, a sensor and a processing pipeline composed into one forward
/// simulation.
///
/// Every stage can be replaced between calls to [`Camera::simulate`]. The
/// sensor must keep the scene size the camera was built for.
#[derive(Clone, Debug)]
pub struct Camera {
    lens: Lens,
    sensor: Sensor,
    pipeline: ProcessingPipeline,
    rng: StdRng,
}

fn clock_seed() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}

impl Camera {
    /// A camera for `rows x cols` scenes with a neutral lens, a noiseless
    /// 10-bit GRBG sensor and the default pipeline.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::from_parts(
            Lens::default(),
            RadiometricSensor::with_size(rows, cols).into(),
            ProcessingPipeline::default(),
        )
    }

    /// Compose a camera from existing stages.
    ///
    /// Shot noise is seeded from the clock; use [`Camera::with_seed`] for
    /// reproducible frames.
    pub fn from_parts(lens: Lens, sensor: Sensor, pipeline: ProcessingPipeline) -> Self {
        Self {
            lens,
            sensor,
            pipeline,
            rng: StdRng::seed_from_u64(clock_seed()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.reseed(seed);
        self
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn lens(&self) -> &Lens {
        &self.lens
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn pipeline(&self) -> &ProcessingPipeline {
        &self.pipeline
    }

    pub fn lens_mut(&mut self) -> &mut Lens {
        &mut self.lens
    }

    pub fn sensor_mut(&mut self) -> &mut Sensor {
        &mut self.sensor
    }

    pub fn pipeline_mut(&mut self) -> &mut ProcessingPipeline {
        &mut self.pipeline
    }

    pub fn set_lens(&mut self, lens: impl Into<Lens>) {
        self.lens = lens.into();
    }

    pub fn set_sensor(&mut self, sensor: impl Into<Sensor>) {
        self.sensor = sensor.into();
    }

    pub fn set_pipeline(&mut self, pipeline: ProcessingPipeline) {
        self.pipeline = pipeline;
    }

    /// Simulate one exposure of `scene`, a `(H, W, 3)` array of photons per
    /// second, drawing shot noise from the camera's own generator.
    pub fn simulate(&mut self, scene: ArrayView3<f64>, exposure: Time) -> Result<OutputImage> {
        let mut rng = self.rng.clone();
        let result = self.simulate_with_rng(scene, exposure, &mut rng);
        self.rng = rng;
        result
    }

    /// Simulate one exposure of `scene` with shot noise drawn from `rng`.
    pub fn simulate_with_rng<R: Rng + ?Sized>(
        &self,
        scene: ArrayView3<f64>,
        exposure: Time,
        rng: &mut R,
    ) -> Result<OutputImage> {
        let radiance = self.lens.apply(scene);
        debug!(shape = ?radiance.shape(), "lens applied");

        let raw = self.sensor.expose_at(radiance.view(), exposure, rng)?;
        debug!(
            shape = ?raw.shape(),
            exposure_s = exposure.get::<second>(),
            "sensor exposed"
        );

        let image = self.pipeline.run(raw.view())?;
        debug!(shape = ?image.shape(), depth = ?image.depth(), "pipeline finished");
        Ok(image)
    }

    /// Derive an exposure time for `scene` from the sensor's ADC ceiling,
    /// peak quantum efficiency and gain.
    ///
    /// A black scene yields an infinite exposure.
    pub fn auto_exposure_time(&self, scene: ArrayView3<f64>, mode: AutoExposureMode) -> Time {
        let max_dn = self.sensor.max_dn() as f64;
        let max_qe = self.sensor.qe().into_iter().fold(0.0, f64::max);
        let gain = self.sensor.gain();

        let target = match mode {
            AutoExposureMode::GrayWorld => 2.0 * scene.mean().unwrap_or(0.0),
            AutoExposureMode::Saturation => scene.iter().copied().fold(0.0, f64::max),
        };

        let denominator = target * max_qe * gain;
        if denominator <= 0.0 {
            warn!(%mode, "scene statistic is zero, exposure is unbounded");
        }
        let seconds = max_dn / denominator;
        debug!(%mode, seconds, "auto exposure");
        Time::new::<second>(seconds)
    }
}
