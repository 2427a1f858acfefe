//! Precomputed per-timestep diffusion coefficients
//!
//! Everything here is derived once from the beta schedule in `f64` and is
//! read-only afterwards. Notation follows Ho et al. 2020: `alpha_t = 1 - beta_t`,
//! `alpha_bar_t = prod_{s<=t} alpha_s`.

use crate::error::{DiffusionError, Result};

/// Floor applied to the posterior variance before taking its log.
/// `posterior_variance[0]` is exactly zero since there is no step before 0.
pub const POSTERIOR_LOG_VARIANCE_FLOOR: f64 = 1e-20;

/// Derived quantity table for a fixed beta schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionCoefficients {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    one_minus_alphas_cumprod: Vec<f64>,

    // q(x_t | x_0)
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    log_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,

    // q(x_{t-1} | x_t, x_0)
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl DiffusionCoefficients {
    /// Build the table from a beta sequence. Every beta must lie in `(0, 1]`.
    pub fn new(betas: &[f64]) -> Result<Self> {
        if betas.is_empty() {
            return Err(DiffusionError::EmptySchedule);
        }
        if let Some((index, &value)) = betas
            .iter()
            .enumerate()
            .find(|(_, b)| !(**b > 0.0 && **b <= 1.0))
        {
            return Err(DiffusionError::BetaOutOfRange { index, value });
        }

        let betas = betas.to_vec();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut cumprod = 1.0;
        for alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }

        let mut alphas_cumprod_prev = Vec::with_capacity(alphas.len());
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..alphas_cumprod.len() - 1]);

        let one_minus_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| 1.0 - a).collect();

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            one_minus_alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let log_one_minus_alphas_cumprod =
            one_minus_alphas_cumprod.iter().map(|a| a.ln()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod
            .iter()
            .map(|a| (1.0 / a - 1.0).sqrt())
            .collect();

        // beta_tilde_t = beta_t * (1 - alpha_bar_{t-1}) / (1 - alpha_bar_t)
        let posterior_variance: Vec<f64> = (0..betas.len())
            .map(|t| {
                betas[t] * (1.0 - alphas_cumprod_prev[t]) / one_minus_alphas_cumprod[t]
            })
            .collect();
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .map(|v| v.max(POSTERIOR_LOG_VARIANCE_FLOOR).ln())
            .collect();
        let posterior_mean_coef1 = (0..betas.len())
            .map(|t| betas[t] * alphas_cumprod_prev[t].sqrt() / one_minus_alphas_cumprod[t])
            .collect();
        let posterior_mean_coef2 = (0..betas.len())
            .map(|t| {
                (1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / one_minus_alphas_cumprod[t]
            })
            .collect();

        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            one_minus_alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            log_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    /// Number of diffusion timesteps `T`
    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    /// `1 - alpha_bar_t`, the variance of q(x_t | x_0)
    pub fn one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.one_minus_alphas_cumprod
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    pub fn log_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.log_one_minus_alphas_cumprod
    }

    pub fn sqrt_recip_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_recip_alphas_cumprod
    }

    pub fn sqrt_recipm1_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_recipm1_alphas_cumprod
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    pub fn posterior_log_variance_clipped(&self) -> &[f64] {
        &self.posterior_log_variance_clipped
    }

    pub fn posterior_mean_coef1(&self) -> &[f64] {
        &self.posterior_mean_coef1
    }

    pub fn posterior_mean_coef2(&self) -> &[f64] {
        &self.posterior_mean_coef2
    }
}
