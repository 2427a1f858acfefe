//! Reverse (ancestral) sampling for [`GaussianDiffusion`]
//!
//! Implements the reverse process p(x_{t-1} | x_t) of Ho et al. 2020 with
//! the posterior variance `beta_tilde_t`:
//!   x_{t-1} = mu_theta(x_t, t) + [t > 0] * exp(0.5 * log beta_tilde_t) * z
//!
//! Steps are strictly sequential; each consumes the output of the previous one.

use candle_core::{Device, Shape, Tensor};
use tracing::{debug, info, trace};

use crate::denoiser::Denoiser;
use crate::diffusion::{GaussianDiffusion, MeanVariance, check_same_shape, check_sample};
use crate::error::{DiffusionError, Result};
use crate::gather::{broadcast_shape, timesteps_to_vec};
use crate::noise::{NoiseSource, noise_like};

/// Per-step options of [`GaussianDiffusion::p_sample`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOptions {
    /// Clamp the predicted clean sample to `[-1, 1]` before forming the posterior
    pub clip_denoised: bool,
    /// Use the same noise for every batch element
    pub repeat_noise: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            clip_denoised: true,
            repeat_noise: false,
        }
    }
}

/// Intermediate states of a reverse diffusion run.
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// `[T-1, T-2, ..., 0, -1]`: the timestep each recorded image is at
    pub timesteps: Vec<i64>,
    /// Initial noise followed by the output of every reverse step
    pub images: Vec<Tensor>,
}

impl Trajectory {
    /// The fully denoised sample
    pub fn last(&self) -> Option<&Tensor> {
        self.images.last()
    }
}

/// How the two endpoints of an interpolation are diffused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterpolationNoise {
    /// Independent noise for each endpoint
    #[default]
    Independent,
    /// The same noise tensor for both endpoints
    Shared,
}

/// Inputs of [`GaussianDiffusion::interpolate`]
#[derive(Debug, Clone)]
pub struct Interpolation {
    pub x1: Tensor,
    pub x2: Tensor,
    /// Mixing weight; `0` keeps `x1`, `1` keeps `x2`, `0.5` averages
    pub lam: f64,
    /// Timestep both endpoints are diffused to before mixing (`0` = one step)
    pub t: usize,
    pub noise: InterpolationNoise,
}

impl Interpolation {
    pub fn new(x1: Tensor, x2: Tensor, lam: f64, t: usize) -> Self {
        Self {
            x1,
            x2,
            lam,
            t,
            noise: InterpolationNoise::default(),
        }
    }

    pub fn with_noise(mut self, noise: InterpolationNoise) -> Self {
        self.noise = noise;
        self
    }
}

/// Result of [`GaussianDiffusion::interpolate`]
#[derive(Debug, Clone)]
pub struct InterpolationOutput {
    pub x1: Tensor,
    pub x2: Tensor,
    pub lam: f64,
    pub x_interp: Tensor,
    pub t: usize,
}

impl GaussianDiffusion {
    /// Mean and variance of p(x_{t-1} | x_t) from the denoiser's noise estimate.
    pub fn p_mean_variance<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x: &Tensor,
        t: &Tensor,
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        self.require_noise_prediction()?;
        check_sample(x)?;

        let eps = denoiser.denoise(x, t)?;
        check_same_shape("denoiser output", x, &eps)?;
        let mut x_recon = self.predict_start_from_noise(x, t, &eps)?;
        if clip_denoised {
            x_recon = x_recon.clamp(-1f64, 1f64)?;
        }

        self.q_posterior(&x_recon, x, t)
    }

    /// One reverse step x_t -> x_{t-1}. No noise is added to batch elements at `t = 0`.
    pub fn p_sample<D, N>(
        &self,
        denoiser: &D,
        x: &Tensor,
        t: &Tensor,
        source: &mut N,
        options: SampleOptions,
    ) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        let MeanVariance {
            mean, log_variance, ..
        } = self.p_mean_variance(denoiser, x, t, options.clip_denoised)?;

        let noise = noise_like(x.shape(), source, options.repeat_noise, x.dtype(), x.device())?;

        let steps = timesteps_to_vec(t, self.num_timesteps())?;
        let mask: Vec<f64> = steps
            .iter()
            .map(|&step| if step == 0 { 0.0 } else { 1.0 })
            .collect();
        let mask = Tensor::from_vec(mask, broadcast_shape(steps.len(), x.rank()), x.device())?
            .to_dtype(x.dtype())?;

        let std = (log_variance * 0.5)?.exp()?;
        let scaled_noise = (mask * std)?.broadcast_mul(&noise)?;
        Ok((mean + scaled_noise)?)
    }

    /// Generate samples of `shape` (`[B, H, W, C]`) starting from pure noise,
    /// running all `T` reverse steps.
    pub fn p_sample_loop<D, N>(
        &self,
        denoiser: &D,
        shape: impl Into<Shape>,
        source: &mut N,
    ) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.require_noise_prediction()?;
        let shape = sample_shape(shape)?;
        let img = source.randn(&shape, self.dtype(), self.device())?;
        self.reverse_loop(denoiser, img, self.num_timesteps() - 1, source)
    }

    /// Like [`Self::p_sample_loop`] but records every intermediate image.
    ///
    /// When `repeat_noise_steps >= 0` the initial noise is shared across the
    /// batch, and so is the step noise for the first `repeat_noise_steps`
    /// steps; the remaining steps use independent noise per element.
    pub fn p_sample_loop_trajectory<D, N>(
        &self,
        denoiser: &D,
        shape: impl Into<Shape>,
        source: &mut N,
        repeat_noise_steps: i64,
    ) -> Result<Trajectory>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.require_noise_prediction()?;
        let shape = sample_shape(shape)?;
        let num_timesteps = self.num_timesteps();
        let batch = shape.dims()[0];

        info!(
            num_steps = num_timesteps,
            shape = ?shape.dims(),
            repeat_noise_steps,
            "Starting reverse diffusion trajectory"
        );

        let mut img = noise_like(
            &shape,
            source,
            repeat_noise_steps >= 0,
            self.dtype(),
            self.device(),
        )?;

        let mut timesteps = Vec::with_capacity(num_timesteps + 1);
        let mut images = Vec::with_capacity(num_timesteps + 1);
        timesteps.push(num_timesteps as i64 - 1);
        images.push(img.clone());

        for step in (0..num_timesteps).rev() {
            let repeat_noise = ((num_timesteps - step) as i64) <= repeat_noise_steps;
            trace!(timestep = step, repeat_noise, "Reverse step");

            let t = timestep_batch(step, batch, img.device())?;
            img = self.p_sample(
                denoiser,
                &img,
                &t,
                source,
                SampleOptions {
                    clip_denoised: true,
                    repeat_noise,
                },
            )?;
            timesteps.push(step as i64 - 1);
            images.push(img.clone());
        }

        info!(num_images = images.len(), "Reverse diffusion trajectory complete");
        Ok(Trajectory { timesteps, images })
    }

    /// Interpolate between two clean samples in latent space: diffuse both to
    /// `t`, mix `(1 - lam) * x_t1 + lam * x_t2`, then denoise from `t` to 0.
    pub fn interpolate<D, N>(
        &self,
        denoiser: &D,
        request: &Interpolation,
        source: &mut N,
    ) -> Result<InterpolationOutput>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.require_noise_prediction()?;
        let Interpolation {
            x1,
            x2,
            lam,
            t,
            noise,
        } = request;
        check_sample(x1)?;
        check_same_shape("x2", x1, x2)?;
        if *t >= self.num_timesteps() {
            return Err(DiffusionError::TimestepOutOfRange {
                t: *t as i64,
                num_timesteps: self.num_timesteps(),
            });
        }

        debug!(t, lam, noise = ?noise, "Interpolating between samples");

        let t_batched = timestep_batch(*t, x1.dims()[0], x1.device())?;
        let (xt1, xt2) = match noise {
            InterpolationNoise::Independent => (
                self.q_sample_from(x1, &t_batched, source)?,
                self.q_sample_from(x2, &t_batched, source)?,
            ),
            InterpolationNoise::Shared => {
                let eps = source.randn(x1.shape(), x1.dtype(), x1.device())?;
                (
                    self.q_sample(x1, &t_batched, Some(&eps))?,
                    self.q_sample(x2, &t_batched, Some(&eps))?,
                )
            }
        };

        let xt_interp = ((xt1 * (1.0 - lam))? + (xt2 * *lam)?)?;
        let x_interp = self.reverse_loop(denoiser, xt_interp, *t, source)?;

        Ok(InterpolationOutput {
            x1: x1.clone(),
            x2: x2.clone(),
            lam: *lam,
            x_interp,
            t: *t,
        })
    }

    /// Run `p_sample` from `start_step` down to 0, threading the image through
    fn reverse_loop<D, N>(
        &self,
        denoiser: &D,
        mut img: Tensor,
        start_step: usize,
        source: &mut N,
    ) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        let batch = img.dims()[0];
        info!(
            num_steps = start_step + 1,
            shape = ?img.dims(),
            "Starting reverse diffusion loop"
        );

        for step in (0..=start_step).rev() {
            trace!(timestep = step, "Reverse step");
            let t = timestep_batch(step, batch, img.device())?;
            img = self.p_sample(denoiser, &img, &t, source, SampleOptions::default())?;
        }

        info!("Reverse diffusion loop complete");
        Ok(img)
    }
}

/// `[B]` timestep tensor filled with `step`, placed next to the sample it indexes
fn timestep_batch(step: usize, batch: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(vec![step as u32; batch], batch, device)?)
}

fn sample_shape(shape: impl Into<Shape>) -> Result<Shape> {
    let shape = shape.into();
    if shape.rank() != 4 {
        return Err(DiffusionError::InvalidRank {
            expected: 4,
            got: shape.dims().to_vec(),
        });
    }
    Ok(shape)
}
