//! Denoising model interface

use candle_core::Tensor;

/// A (typically learned) function mapping a noisy batch `x: [B, H, W, C]`
/// and timesteps `t: [B]` to a prediction with the shape of `x`.
///
/// With [`crate::LossType::NoisePred`] the prediction is the noise that
/// produced `x` from the clean sample.
pub trait Denoiser {
    fn denoise(&self, x: &Tensor, t: &Tensor) -> candle_core::Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    fn denoise(&self, x: &Tensor, t: &Tensor) -> candle_core::Result<Tensor> {
        self(x, t)
    }
}
