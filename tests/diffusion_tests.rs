//! End-to-end tests for the forward process, reverse sampling and loss
//!
//! Denoisers here are closures and a tiny `candle_nn::Linear` acting on the
//! channel dimension; timesteps are ignored by all of them.

use candle_core::{DType, Device, Module, Shape, Tensor};
use candle_ddpm::{
    BetaScheduleKind, DiffusionConfig, GaussianDiffusion, Interpolation, InterpolationNoise,
    NoiseSource, Pcg32, Result, SampleOptions,
};
use candle_nn::Linear;

// =============================================================================
// Helper functions
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn create_test_diffusion(kind: BetaScheduleKind, steps: usize) -> GaussianDiffusion {
    let config = DiffusionConfig::new(kind, steps);
    GaussianDiffusion::from_config(&config, Device::Cpu, DType::F32).unwrap()
}

fn zero_denoiser(x: &Tensor, _t: &Tensor) -> candle_core::Result<Tensor> {
    x.zeros_like()
}

fn create_linear_denoiser(channels: usize, device: &Device) -> candle_core::Result<Linear> {
    let weight = (Tensor::eye(channels, DType::F32, device)? * 0.1)?;
    let bias = Tensor::zeros(channels, DType::F32, device)?;
    Ok(Linear::new(weight, Some(bias)))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

// =============================================================================
// Forward Process Tests
// =============================================================================

#[test]
fn test_q_sample_of_zeros_is_zero() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Quad, 50);
    let device = Device::Cpu;
    let zeros = Tensor::zeros((4, 3, 3, 2), DType::F32, &device)?;
    let t = Tensor::new(&[0u32, 17, 33, 49], &device)?;

    let out = diffusion.q_sample(&zeros, &t, Some(&zeros))?;
    assert_eq!(max_abs_diff(&out, &zeros)?, 0.0);
    Ok(())
}

#[test]
fn test_round_trip_identity_per_element_timesteps() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 100);
    let device = Device::Cpu;
    let mut rng = Pcg32::seeded(21);
    let shape = Shape::from((5, 4, 4, 3));
    let x_start = rng.randn(&shape, DType::F32, &device)?;
    let noise = rng.randn(&shape, DType::F32, &device)?;
    let t = Tensor::new(&[99u32, 0, 42, 7, 63], &device)?;

    let x_t = diffusion.q_sample(&x_start, &t, Some(&noise))?;
    let x_rec = diffusion.predict_start_from_noise(&x_t, &t, &noise)?;
    assert!(max_abs_diff(&x_rec, &x_start)? < 1e-4);
    Ok(())
}

#[test]
fn test_q_mean_variance_matches_q_sample_statistics() -> Result<()> {
    // q_sample(x, t, noise) == mean + sqrt(variance) * noise
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 20);
    let device = Device::Cpu;
    let mut rng = Pcg32::seeded(5);
    let shape = Shape::from((2, 2, 2, 2));
    let x = rng.randn(&shape, DType::F32, &device)?;
    let noise = rng.randn(&shape, DType::F32, &device)?;
    let t = Tensor::new(&[3u32, 19], &device)?;

    let mv = diffusion.q_mean_variance(&x, &t)?;
    let expected = (mv.mean + mv.variance.sqrt()?.broadcast_mul(&noise)?)?;
    let sampled = diffusion.q_sample(&x, &t, Some(&noise))?;
    assert!(max_abs_diff(&expected, &sampled)? < 1e-5);
    Ok(())
}

#[test]
fn test_forward_preserves_dtype() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 10);
    let device = Device::Cpu;
    let x = Tensor::ones((1, 2, 2, 1), DType::F64, &device)?;
    let t = Tensor::new(&[5i64], &device)?;
    let out = diffusion.q_sample(&x, &t, Some(&x))?;
    assert_eq!(out.dtype(), DType::F64);
    Ok(())
}

// =============================================================================
// Reverse Sampling Tests
// =============================================================================

#[test]
fn test_p_sample_loop_shape_and_finiteness() -> Result<()> {
    init_tracing();
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 20);
    let device = Device::Cpu;
    let model = create_linear_denoiser(3, &device)?;
    let denoiser = |x: &Tensor, _t: &Tensor| model.forward(x);

    let out = diffusion.p_sample_loop(&denoiser, (2, 4, 4, 3), &mut Pcg32::seeded(1))?;
    assert_eq!(out.dims(), &[2, 4, 4, 3]);
    let values = out.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn test_p_sample_loop_reproducible_with_seed() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Quad, 15);
    let a = diffusion.p_sample_loop(&zero_denoiser, (2, 3, 3, 1), &mut Pcg32::seeded(77))?;
    let b = diffusion.p_sample_loop(&zero_denoiser, (2, 3, 3, 1), &mut Pcg32::seeded(77))?;
    assert_eq!(max_abs_diff(&a, &b)?, 0.0);
    Ok(())
}

#[test]
fn test_final_step_clips_zero_noise_prediction() -> Result<()> {
    // With a zero noise estimate the last step returns the clipped x_0 estimate
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 10);
    let out = diffusion.p_sample_loop(&zero_denoiser, (3, 4, 4, 1), &mut Pcg32::seeded(9))?;
    let values = out.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| *v >= -1.0 - 1e-5 && *v <= 1.0 + 1e-5));
    Ok(())
}

#[test]
fn test_p_sample_without_clipping_or_with_repeat() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 10);
    let device = Device::Cpu;
    let x = Tensor::zeros((3, 2, 2, 1), DType::F32, &device)?;
    let t = Tensor::new(&[4u32, 4, 4], &device)?;

    let options = SampleOptions {
        clip_denoised: false,
        repeat_noise: true,
    };
    let out = diffusion.p_sample(&zero_denoiser, &x, &t, &mut Pcg32::seeded(3), options)?;
    let lane0 = out.get(0)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(out.get(1)?.flatten_all()?.to_vec1::<f32>()?, lane0);
    assert_eq!(out.get(2)?.flatten_all()?.to_vec1::<f32>()?, lane0);
    Ok(())
}

#[test]
fn test_trajectory_ends_with_loop_result() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 8);
    // With no repeated noise the trajectory consumes the same draws as the plain loop
    let traj =
        diffusion.p_sample_loop_trajectory(&zero_denoiser, (2, 2, 2, 1), &mut Pcg32::seeded(4), -1)?;
    let direct = diffusion.p_sample_loop(&zero_denoiser, (2, 2, 2, 1), &mut Pcg32::seeded(4))?;

    assert_eq!(traj.timesteps.first(), Some(&7));
    assert_eq!(traj.timesteps.last(), Some(&-1));
    assert_eq!(traj.images.len(), 9);
    let last = traj.last().unwrap();
    assert_eq!(max_abs_diff(last, &direct)?, 0.0);
    Ok(())
}

// =============================================================================
// Interpolation Tests
// =============================================================================

fn manual_reverse(
    diffusion: &GaussianDiffusion,
    mut img: Tensor,
    from: usize,
    rng: &mut Pcg32,
) -> Result<Tensor> {
    let batch = img.dims()[0];
    for step in (0..=from).rev() {
        let t = Tensor::from_vec(vec![step as u32; batch], batch, &Device::Cpu)?;
        img = diffusion.p_sample(&zero_denoiser, &img, &t, rng, SampleOptions::default())?;
    }
    Ok(img)
}

#[test]
fn test_interpolate_endpoints() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 30);
    let device = Device::Cpu;
    let shape = Shape::from((2, 3, 3, 1));
    let mut data_rng = Pcg32::seeded(100);
    let x1 = data_rng.randn(&shape, DType::F32, &device)?.clamp(-1f32, 1f32)?;
    let x2 = data_rng.randn(&shape, DType::F32, &device)?.clamp(-1f32, 1f32)?;
    let t = 12;
    let t_batched = Tensor::new(&[t as u32, t as u32], &device)?;

    for (lam, endpoint) in [(0.0, 0usize), (1.0, 1usize)] {
        let request = Interpolation::new(x1.clone(), x2.clone(), lam, t);
        let out = diffusion.interpolate(&zero_denoiser, &request, &mut Pcg32::seeded(5))?;
        assert_eq!(out.t, t);
        assert_eq!(out.lam, lam);
        assert_eq!(out.x_interp.dims(), shape.dims());

        // Replay: diffuse both endpoints, keep the selected one, denoise from t
        let mut rng = Pcg32::seeded(5);
        let xt1 = diffusion.q_sample_from(&x1, &t_batched, &mut rng)?;
        let xt2 = diffusion.q_sample_from(&x2, &t_batched, &mut rng)?;
        let start = if endpoint == 0 { xt1 } else { xt2 };
        let expected = manual_reverse(&diffusion, start, t, &mut rng)?;
        assert!(max_abs_diff(&out.x_interp, &expected)? < 1e-6);
    }
    Ok(())
}

#[test]
fn test_interpolate_shared_noise() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 10);
    let device = Device::Cpu;
    let x = Tensor::full(0.5f32, (1, 2, 2, 1), &device)?;

    // Identical endpoints with shared noise: mixing is a no-op for any lam
    let request = Interpolation::new(x.clone(), x.clone(), 0.3, 4).with_noise(InterpolationNoise::Shared);
    let mixed = diffusion.interpolate(&zero_denoiser, &request, &mut Pcg32::seeded(8))?;

    let request = Interpolation::new(x.clone(), x.clone(), 0.0, 4).with_noise(InterpolationNoise::Shared);
    let single = diffusion.interpolate(&zero_denoiser, &request, &mut Pcg32::seeded(8))?;
    assert!(max_abs_diff(&mixed.x_interp, &single.x_interp)? < 1e-5);
    Ok(())
}

#[test]
fn test_interpolate_rejects_bad_inputs() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 10);
    let device = Device::Cpu;
    let x1 = Tensor::zeros((1, 2, 2, 1), DType::F32, &device)?;
    let x2 = Tensor::zeros((1, 2, 2, 3), DType::F32, &device)?;

    let request = Interpolation::new(x1.clone(), x2, 0.5, 3);
    assert!(diffusion.interpolate(&zero_denoiser, &request, &mut Pcg32::seeded(0)).is_err());

    let request = Interpolation::new(x1.clone(), x1, 0.5, 10);
    assert!(diffusion.interpolate(&zero_denoiser, &request, &mut Pcg32::seeded(0)).is_err());
    Ok(())
}

// =============================================================================
// Loss Tests
// =============================================================================

#[test]
fn test_p_losses_with_linear_model() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 100);
    let device = Device::Cpu;
    let model = create_linear_denoiser(2, &device)?;
    let denoiser = |x: &Tensor, _t: &Tensor| model.forward(x);

    let mut rng = Pcg32::seeded(12);
    let x_start = rng.randn(&Shape::from((3, 4, 4, 2)), DType::F32, &device)?;
    let t = Tensor::new(&[1u32, 50, 99], &device)?;

    let losses = diffusion.p_losses_from(&denoiser, &x_start, &t, &mut rng)?;
    assert_eq!(losses.dims(), &[3]);
    assert!(losses.to_vec1::<f32>()?.iter().all(|l| l.is_finite() && *l > 0.0));
    Ok(())
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_shared_engine_across_threads() -> Result<()> {
    let diffusion = create_test_diffusion(BetaScheduleKind::Linear, 12);

    let results: Vec<Vec<f32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4u64)
            .map(|seed| {
                let diffusion = &diffusion;
                scope.spawn(move || -> Result<Vec<f32>> {
                    let out = diffusion.p_sample_loop(
                        &zero_denoiser,
                        (1, 2, 2, 1),
                        &mut Pcg32::seeded(seed),
                    )?;
                    Ok(out.flatten_all()?.to_vec1::<f32>()?)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("sampling thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    // Same seed on the main thread gives the same sample
    let again = diffusion.p_sample_loop(&zero_denoiser, (1, 2, 2, 1), &mut Pcg32::seeded(2))?;
    assert_eq!(results[2], again.flatten_all()?.to_vec1::<f32>()?);
    Ok(())
}
