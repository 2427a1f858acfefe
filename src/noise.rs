//! Standard-normal noise sources
//!
//! The engine never owns randomness: every draw goes through a
//! [`NoiseSource`] supplied by the caller.

use candle_core::{DType, Device, Shape, Tensor};

/// Source of standard-normal tensors.
pub trait NoiseSource {
    /// Draw a tensor of i.i.d. `N(0, 1)` values with the given shape and dtype
    fn randn(&mut self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor>;
}

impl<N: NoiseSource + ?Sized> NoiseSource for &mut N {
    fn randn(&mut self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        (**self).randn(shape, dtype, device)
    }
}

/// Candle's built-in generator (`Tensor::randn`).
///
/// Seeding goes through `Device::set_seed`, so streams are per-device and
/// not reproducible across backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleNoise;

impl NoiseSource for CandleNoise {
    fn randn(&mut self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::randn(0f32, 1f32, shape.clone(), device)?.to_dtype(dtype)
    }
}

/// PCG32 Random Number Generator
/// Simple, fast, and statistically good RNG.
/// Produces the same stream on every device since sampling happens on the host.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Default PCG stream selector
    pub const DEFAULT_STREAM: u64 = 1442695040888963407;

    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Generator on the default stream
    pub fn seeded(seed: u64) -> Self {
        Self::new(seed, Self::DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        // XSH-RR output
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform float in [0, 1) with 24 bits of precision
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Two independent standard normals via Box-Muller
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }
}

impl NoiseSource for Pcg32 {
    fn randn(&mut self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            if data.len() < elem_count {
                data.push(z1);
            }
        }
        Tensor::from_vec(data, shape.clone(), device)?.to_dtype(dtype)
    }
}

/// Draw noise shaped like `shape`. With `repeat`, a single `[1, ...]` lane
/// is drawn and broadcast over the batch so every element sees the same noise.
pub fn noise_like<N: NoiseSource + ?Sized>(
    shape: &Shape,
    source: &mut N,
    repeat: bool,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    if !repeat || shape.rank() == 0 {
        return source.randn(shape, dtype, device);
    }
    let mut lane = shape.dims().to_vec();
    lane[0] = 1;
    source
        .randn(&Shape::from(lane), dtype, device)?
        .broadcast_as(shape.clone())?
        .contiguous()
}
