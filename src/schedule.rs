//! Beta (per-step noise variance) schedules
//!
//! All schedules are evaluated in `f64`. The ramps follow numpy `linspace`
//! semantics: both endpoints are included and a single-point ramp yields
//! just the start value.

use crate::config::BetaScheduleKind;
use crate::error::{DiffusionError, Result};

/// `num` evenly spaced values over `[start, end]`, endpoints included
pub fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            let mut values: Vec<f64> = (0..num).map(|i| start + step * i as f64).collect();
            // Pin the last value so rounding never overshoots the endpoint
            values[num - 1] = end;
            values
        }
    }
}

/// Ramp from `beta_start` to `beta_end` over the first
/// `floor(num_diffusion_timesteps * warmup_frac)` steps, then hold `beta_end`.
fn warmup_beta(
    beta_start: f64,
    beta_end: f64,
    num_diffusion_timesteps: usize,
    warmup_frac: f64,
) -> Vec<f64> {
    let warmup_time = (num_diffusion_timesteps as f64 * warmup_frac) as usize;
    let mut betas = vec![beta_end; num_diffusion_timesteps];
    for (beta, value) in betas
        .iter_mut()
        .zip(linspace(beta_start, beta_end, warmup_time))
    {
        *beta = value;
    }
    betas
}

/// Compute the beta sequence of length `num_diffusion_timesteps` for `kind`.
pub fn get_beta_schedule(
    kind: BetaScheduleKind,
    beta_start: f64,
    beta_end: f64,
    num_diffusion_timesteps: usize,
) -> Result<Vec<f64>> {
    if num_diffusion_timesteps == 0 {
        return Err(DiffusionError::EmptySchedule);
    }
    let n = num_diffusion_timesteps;

    let betas = match kind {
        BetaScheduleKind::Quad => linspace(beta_start.sqrt(), beta_end.sqrt(), n)
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaScheduleKind::Linear => linspace(beta_start, beta_end, n),
        BetaScheduleKind::Warmup10 => warmup_beta(beta_start, beta_end, n, 0.1),
        BetaScheduleKind::Warmup50 => warmup_beta(beta_start, beta_end, n, 0.5),
        BetaScheduleKind::Const => vec![beta_end; n],
        // 1/T, 1/(T-1), ..., 1
        BetaScheduleKind::Jsd => (0..n).map(|i| 1.0 / (n - i) as f64).collect(),
    };

    debug_assert_eq!(betas.len(), n);
    Ok(betas)
}

/// Look up a schedule by name, failing on unknown kinds
pub fn get_beta_schedule_by_name(
    name: &str,
    beta_start: f64,
    beta_end: f64,
    num_diffusion_timesteps: usize,
) -> Result<Vec<f64>> {
    get_beta_schedule(name.parse()?, beta_start, beta_end, num_diffusion_timesteps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [BetaScheduleKind; 6] = [
        BetaScheduleKind::Quad,
        BetaScheduleKind::Linear,
        BetaScheduleKind::Warmup10,
        BetaScheduleKind::Warmup50,
        BetaScheduleKind::Const,
        BetaScheduleKind::Jsd,
    ];

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(0.0, 1.0, 5);
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(3.0, 7.0, 1), vec![3.0]);
        assert!(linspace(3.0, 7.0, 0).is_empty());
    }

    #[test]
    fn test_all_kinds_length_and_range() {
        for kind in ALL_KINDS {
            for n in [1, 2, 7, 10, 1000] {
                let betas = get_beta_schedule(kind, 1e-4, 0.02, n).unwrap();
                assert_eq!(betas.len(), n, "{kind} with T={n}");
                for (i, b) in betas.iter().enumerate() {
                    assert!(*b > 0.0 && *b <= 1.0, "{kind}[{i}] = {b}");
                }
            }
        }
    }

    #[test]
    fn test_linear_four_steps() {
        let betas = get_beta_schedule(BetaScheduleKind::Linear, 1e-4, 0.02, 4).unwrap();
        let expected = [0.0001, 0.0067, 0.0134, 0.02];
        for (b, e) in betas.iter().zip(expected) {
            assert!((b - e).abs() < 1e-4, "got {b}, expected {e}");
        }
    }

    #[test]
    fn test_quad_is_square_of_sqrt_ramp() {
        let betas = get_beta_schedule(BetaScheduleKind::Quad, 1e-4, 0.02, 10).unwrap();
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[9] - 0.02).abs() < 1e-12);
        let roots: Vec<f64> = betas.iter().map(|b| b.sqrt()).collect();
        let step = roots[1] - roots[0];
        for w in roots.windows(2) {
            assert!((w[1] - w[0] - step).abs() < 1e-12);
        }
    }

    #[test]
    fn test_const_schedule() {
        let betas = get_beta_schedule(BetaScheduleKind::Const, 1e-4, 0.01, 5).unwrap();
        assert_eq!(betas, vec![0.01; 5]);
    }

    #[test]
    fn test_jsd_schedule() {
        let betas = get_beta_schedule(BetaScheduleKind::Jsd, 1e-4, 0.02, 3).unwrap();
        assert_eq!(betas, vec![1.0 / 3.0, 1.0 / 2.0, 1.0]);
    }

    #[test]
    fn test_warmup_schedules() {
        let betas = get_beta_schedule(BetaScheduleKind::Warmup10, 0.001, 0.02, 25).unwrap();
        // int(25 * 0.1) = 2 warmup steps
        assert_eq!(betas[0], 0.001);
        assert_eq!(betas[1], 0.02);
        assert!(betas[2..].iter().all(|b| *b == 0.02));

        let betas = get_beta_schedule(BetaScheduleKind::Warmup50, 0.001, 0.02, 10).unwrap();
        assert_eq!(betas[0], 0.001);
        assert!(betas[0..5].windows(2).all(|w| w[1] > w[0]));
        assert_eq!(betas[4], 0.02);
        assert!(betas[5..].iter().all(|b| *b == 0.02));
    }

    #[test]
    fn test_warmup_shorter_than_one_step() {
        // int(5 * 0.1) = 0: no ramp at all
        let betas = get_beta_schedule(BetaScheduleKind::Warmup10, 0.001, 0.02, 5).unwrap();
        assert_eq!(betas, vec![0.02; 5]);
    }

    #[test]
    fn test_unknown_schedule_name() {
        let err = get_beta_schedule_by_name("cosine", 1e-4, 0.02, 10).unwrap_err();
        assert!(matches!(err, DiffusionError::UnsupportedSchedule(_)));
        assert!(get_beta_schedule_by_name("quad", 1e-4, 0.02, 10).is_ok());
    }

    #[test]
    fn test_empty_schedule() {
        assert!(matches!(
            get_beta_schedule(BetaScheduleKind::Linear, 1e-4, 0.02, 0),
            Err(DiffusionError::EmptySchedule)
        ));
    }
}
