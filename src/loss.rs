//! Training objective for [`GaussianDiffusion`]

use candle_core::Tensor;
use tracing::trace;

use crate::config::LossType;
use crate::denoiser::Denoiser;
use crate::diffusion::{GaussianDiffusion, check_same_shape, check_sample};
use crate::error::{DiffusionError, Result};
use crate::noise::{CandleNoise, NoiseSource};

/// Mean over every dimension except the leading batch dimension.
pub fn mean_flat(x: &Tensor) -> candle_core::Result<Tensor> {
    if x.rank() <= 1 {
        return Ok(x.clone());
    }
    x.flatten_from(1)?.mean(1)
}

/// KL divergence between two diagonal Gaussians given by mean and log-variance.
///
/// Operands broadcast against each other, so per-example `[B, 1, 1, 1]`
/// variances can be paired with `[B, H, W, C]` means.
pub fn normal_kl(
    mean1: &Tensor,
    logvar1: &Tensor,
    mean2: &Tensor,
    logvar2: &Tensor,
) -> candle_core::Result<Tensor> {
    // 0.5 * (-1 + logvar2 - logvar1 + exp(logvar1 - logvar2) + (mean1 - mean2)^2 * exp(-logvar2))
    let dlog = logvar1.broadcast_sub(logvar2)?;
    let mahalanobis = mean1
        .broadcast_sub(mean2)?
        .sqr()?
        .broadcast_mul(&logvar2.neg()?.exp()?)?;
    (dlog.neg()? + dlog.exp()?)?
        .broadcast_add(&mahalanobis)?
        .affine(0.5, -0.5)
}

impl GaussianDiffusion {
    /// Per-example training loss, shaped `[B]`.
    ///
    /// Diffuses `x_start` to `t` with `noise` (drawn from candle's generator
    /// when absent) and scores the denoiser's noise prediction by mean squared
    /// error over all non-batch dimensions.
    pub fn p_losses<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x_start: &Tensor,
        t: &Tensor,
        noise: Option<&Tensor>,
    ) -> Result<Tensor> {
        match noise {
            Some(noise) => self.p_losses_with_noise(denoiser, x_start, t, noise),
            None => self.p_losses_from(denoiser, x_start, t, &mut CandleNoise),
        }
    }

    /// [`Self::p_losses`] drawing its noise from `source`
    pub fn p_losses_from<D, N>(
        &self,
        denoiser: &D,
        x_start: &Tensor,
        t: &Tensor,
        source: &mut N,
    ) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        check_sample(x_start)?;
        let noise = source.randn(x_start.shape(), x_start.dtype(), x_start.device())?;
        self.p_losses_with_noise(denoiser, x_start, t, &noise)
    }

    fn p_losses_with_noise<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x_start: &Tensor,
        t: &Tensor,
        noise: &Tensor,
    ) -> Result<Tensor> {
        check_sample(x_start)?;
        check_same_shape("noise", x_start, noise)?;
        if noise.dtype() != x_start.dtype() {
            return Err(DiffusionError::DTypeMismatch {
                what: "noise",
                expected: x_start.dtype(),
                got: noise.dtype(),
            });
        }

        let losses = match self.loss_type() {
            LossType::NoisePred => {
                let x_noisy = self.q_sample(x_start, t, Some(noise))?;
                let x_recon = denoiser.denoise(&x_noisy, t)?;
                check_same_shape("denoiser output", x_start, &x_recon)?;
                mean_flat(&(noise - &x_recon)?.sqr()?)?
            }
            LossType::Other(name) => {
                return Err(DiffusionError::UnsupportedLossType(name.clone()));
            }
        };

        trace!(batch = x_start.dims()[0], "Computed noise prediction losses");
        Ok(losses)
    }
}
