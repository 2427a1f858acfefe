//! Candle-DDPM: Gaussian diffusion for the Candle framework.
//!
//! This crate provides the numerical core of denoising diffusion
//! probabilistic models: beta schedules, the forward noising process and its
//! closed-form posterior, ancestral sampling driven by an external denoiser,
//! and the noise-prediction training loss.

pub mod coefficients;
pub mod config;
pub mod denoiser;
pub mod diffusion;
pub mod error;
pub mod gather;
pub mod loss;
pub mod noise;
pub mod sampler;
pub mod schedule;

pub use coefficients::DiffusionCoefficients;
pub use config::{BetaScheduleKind, DiffusionConfig, LossType};
pub use denoiser::Denoiser;
pub use diffusion::{GaussianDiffusion, MeanVariance};
pub use error::{DiffusionError, Result};
pub use gather::gather;
pub use loss::{mean_flat, normal_kl};
pub use noise::{CandleNoise, NoiseSource, Pcg32, noise_like};
pub use sampler::{
    Interpolation, InterpolationNoise, InterpolationOutput, SampleOptions, Trajectory,
};
pub use schedule::{get_beta_schedule, get_beta_schedule_by_name};
