//! Gaussian diffusion engine: forward process q(x_t | x_0) and its posterior
//!
//! Reverse sampling lives in [`crate::sampler`] and the training loss in
//! [`crate::loss`]; both extend [`GaussianDiffusion`].

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::coefficients::DiffusionCoefficients;
use crate::config::{DiffusionConfig, LossType};
use crate::error::{DiffusionError, Result};
use crate::gather::gather;
use crate::noise::{CandleNoise, NoiseSource};

/// Mean, variance and log-variance of a diagonal Gaussian.
///
/// `variance` and `log_variance` are per-example and shaped `[B, 1, 1, 1]`;
/// `mean` has the shape of the sample.
#[derive(Debug, Clone)]
pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
}

/// Denoising diffusion probabilistic model utilities over a fixed beta schedule.
///
/// Cloning is cheap: the coefficient table is shared and never mutated, so a
/// single engine can serve concurrent sampling and loss calls.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    coeffs: Arc<DiffusionCoefficients>,
    loss_type: LossType,
    device: Device,
    dtype: DType,
}

impl GaussianDiffusion {
    /// Create an engine from an explicit beta sequence.
    ///
    /// `device` and `dtype` are used for tensors the engine creates on its own
    /// (initial noise of the sampling loops); everything else follows the
    /// dtype and device of the inputs.
    pub fn new(
        betas: &[f64],
        loss_type: impl Into<LossType>,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let coeffs = DiffusionCoefficients::new(betas)?;
        let loss_type = loss_type.into();

        debug!(
            num_timesteps = coeffs.num_timesteps(),
            loss_type = %loss_type,
            alphas_cumprod_final = coeffs.alphas_cumprod().last().copied().unwrap_or(1.0),
            "Built Gaussian diffusion coefficients"
        );

        Ok(Self {
            coeffs: Arc::new(coeffs),
            loss_type,
            device,
            dtype,
        })
    }

    /// Create an engine from a configuration
    pub fn from_config(config: &DiffusionConfig, device: Device, dtype: DType) -> Result<Self> {
        let betas = config.betas()?;
        Self::new(&betas, config.loss_type.clone(), device, dtype)
    }

    pub fn num_timesteps(&self) -> usize {
        self.coeffs.num_timesteps()
    }

    pub fn loss_type(&self) -> &LossType {
        &self.loss_type
    }

    pub fn coefficients(&self) -> &DiffusionCoefficients {
        &self.coeffs
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Fail unless the configured parameterization is supported
    pub(crate) fn require_noise_prediction(&self) -> Result<()> {
        match &self.loss_type {
            LossType::NoisePred => Ok(()),
            LossType::Other(name) => Err(DiffusionError::UnsupportedLossType(name.clone())),
        }
    }

    /// `coeffs[t]` broadcastable against `x`, in the dtype and on the device of `x`
    pub(crate) fn extract(&self, coeffs: &[f64], t: &Tensor, x: &Tensor) -> Result<Tensor> {
        gather(coeffs, t, x.shape(), x.dtype(), x.device())
    }

    /// Mean and variance of q(x_t | x_0)
    pub fn q_mean_variance(&self, x_start: &Tensor, t: &Tensor) -> Result<MeanVariance> {
        check_sample(x_start)?;
        let c = &self.coeffs;
        let mean = self
            .extract(c.sqrt_alphas_cumprod(), t, x_start)?
            .broadcast_mul(x_start)?;
        let variance = self.extract(c.one_minus_alphas_cumprod(), t, x_start)?;
        let log_variance = self.extract(c.log_one_minus_alphas_cumprod(), t, x_start)?;
        Ok(MeanVariance {
            mean,
            variance,
            log_variance,
        })
    }

    /// Diffuse `x_start` to step `t`:
    /// `sqrt(alpha_bar_t) * x_0 + sqrt(1 - alpha_bar_t) * noise`.
    ///
    /// Without explicit `noise`, standard-normal noise is drawn from candle's
    /// generator.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: Option<&Tensor>) -> Result<Tensor> {
        match noise {
            Some(noise) => self.q_sample_with_noise(x_start, t, noise),
            None => self.q_sample_from(x_start, t, &mut CandleNoise),
        }
    }

    /// [`Self::q_sample`] drawing its noise from `source`
    pub fn q_sample_from<N: NoiseSource + ?Sized>(
        &self,
        x_start: &Tensor,
        t: &Tensor,
        source: &mut N,
    ) -> Result<Tensor> {
        check_sample(x_start)?;
        let noise = source.randn(x_start.shape(), x_start.dtype(), x_start.device())?;
        self.q_sample_with_noise(x_start, t, &noise)
    }

    fn q_sample_with_noise(&self, x_start: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        check_sample(x_start)?;
        check_same_shape("noise", x_start, noise)?;
        let c = &self.coeffs;
        let signal = self
            .extract(c.sqrt_alphas_cumprod(), t, x_start)?
            .broadcast_mul(x_start)?;
        let noise = self
            .extract(c.sqrt_one_minus_alphas_cumprod(), t, x_start)?
            .broadcast_mul(noise)?;
        Ok((signal + noise)?)
    }

    /// Invert [`Self::q_sample`] for a known noise:
    /// `sqrt(1 / alpha_bar_t) * x_t - sqrt(1 / alpha_bar_t - 1) * noise`.
    pub fn predict_start_from_noise(
        &self,
        x_t: &Tensor,
        t: &Tensor,
        noise: &Tensor,
    ) -> Result<Tensor> {
        check_sample(x_t)?;
        check_same_shape("noise", x_t, noise)?;
        let c = &self.coeffs;
        let scaled = self
            .extract(c.sqrt_recip_alphas_cumprod(), t, x_t)?
            .broadcast_mul(x_t)?;
        let correction = self
            .extract(c.sqrt_recipm1_alphas_cumprod(), t, x_t)?
            .broadcast_mul(noise)?;
        Ok((scaled - correction)?)
    }

    /// Mean and variance of the posterior q(x_{t-1} | x_t, x_0).
    ///
    /// The returned log-variance is clipped at `log(1e-20)` so that `t = 0`
    /// stays finite.
    pub fn q_posterior(&self, x_start: &Tensor, x_t: &Tensor, t: &Tensor) -> Result<MeanVariance> {
        check_sample(x_t)?;
        check_same_shape("x_start", x_t, x_start)?;
        let c = &self.coeffs;
        let mean = (self
            .extract(c.posterior_mean_coef1(), t, x_t)?
            .broadcast_mul(x_start)?
            + self
                .extract(c.posterior_mean_coef2(), t, x_t)?
                .broadcast_mul(x_t)?)?;
        let variance = self.extract(c.posterior_variance(), t, x_t)?;
        let log_variance = self.extract(c.posterior_log_variance_clipped(), t, x_t)?;
        Ok(MeanVariance {
            mean,
            variance,
            log_variance,
        })
    }
}

/// Samples are image-like batches `[B, H, W, C]`
pub(crate) fn check_sample(x: &Tensor) -> Result<()> {
    if x.rank() != 4 {
        return Err(DiffusionError::InvalidRank {
            expected: 4,
            got: x.dims().to_vec(),
        });
    }
    Ok(())
}

pub(crate) fn check_same_shape(what: &'static str, expected: &Tensor, got: &Tensor) -> Result<()> {
    if expected.shape() != got.shape() {
        return Err(DiffusionError::ShapeMismatch {
            what,
            expected: expected.dims().to_vec(),
            got: got.dims().to_vec(),
        });
    }
    Ok(())
}
