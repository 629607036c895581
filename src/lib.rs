// #![warn(missing_docs)]

//! Digital Camera Exposure Simulation
//!
//! Forms a simulated exposure from an ideal scene radiance image in three
//! stages: lens optics ([`optic`]), sensor capture with noise ([`sensor`])
//! and an image processing pipeline ([`pipeline`]). [`camera::Camera`]
//! composes the stages and derives exposure times.

#[allow(missing_docs)]
pub mod error;

pub mod bayer;
pub mod camera;
pub mod curve;
pub mod demosaic;
pub mod optic;
pub mod pipeline;
pub mod resample;
pub mod sensor;

pub mod prelude {
    pub use crate::{
        bayer::{BayerPhase, Channel, mosaic},
        camera::{AutoExposureMode, Camera},
        curve::PolynomialCurve,
        demosaic::{Bilinear, Demosaic},
        error::{Error, Result},
        optic::{Lens, LensParams, OpticalDistortionModel},
        pipeline::{CustomStep, OutputDepth, OutputImage, ProcessingPipeline, ProcessingStep},
        resample::{Bicubic, Resample},
        sensor::{NoiseFloor, RadiometricSensor, Sensor, SensorParams},
    };
}
