//! Configuration structures for the Gaussian diffusion engine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::schedule::get_beta_schedule;

/// Named beta schedule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BetaScheduleKind {
    /// Square of a linear ramp between `sqrt(beta_start)` and `sqrt(beta_end)`
    Quad,
    /// Linear ramp between `beta_start` and `beta_end`
    Linear,
    /// Linear warmup over the first 10% of steps, then `beta_end`
    Warmup10,
    /// Linear warmup over the first 50% of steps, then `beta_end`
    Warmup50,
    /// Constant `beta_end`
    Const,
    /// `1/T, 1/(T-1), ..., 1`
    Jsd,
}

impl BetaScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quad => "quad",
            Self::Linear => "linear",
            Self::Warmup10 => "warmup10",
            Self::Warmup50 => "warmup50",
            Self::Const => "const",
            Self::Jsd => "jsd",
        }
    }
}

impl FromStr for BetaScheduleKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quad" => Ok(Self::Quad),
            "linear" => Ok(Self::Linear),
            "warmup10" => Ok(Self::Warmup10),
            "warmup50" => Ok(Self::Warmup50),
            "const" => Ok(Self::Const),
            "jsd" => Ok(Self::Jsd),
            other => Err(DiffusionError::UnsupportedSchedule(other.to_string())),
        }
    }
}

impl TryFrom<String> for BetaScheduleKind {
    type Error = DiffusionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BetaScheduleKind> for String {
    fn from(kind: BetaScheduleKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for BetaScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training objective / model parameterization.
///
/// Any name is accepted when the engine is built; names other than
/// `noisepred` are kept as [`LossType::Other`] and rejected by every
/// loss or sampling call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LossType {
    /// The denoiser predicts the noise that was added (epsilon prediction)
    NoisePred,
    Other(String),
}

impl LossType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoisePred => "noisepred",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for LossType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "noisepred" => Self::NoisePred,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for LossType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<LossType> for String {
    fn from(loss: LossType) -> Self {
        match loss {
            LossType::NoisePred => "noisepred".to_string(),
            LossType::Other(name) => name,
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction options for [`crate::GaussianDiffusion`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Beta schedule kind
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaScheduleKind,
    /// First beta of the ramp
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    /// Last beta of the ramp (and the plateau for warmup/const)
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    /// Number of diffusion timesteps `T`
    #[serde(default = "default_num_diffusion_timesteps")]
    pub num_diffusion_timesteps: usize,
    /// Loss / parameterization kind
    #[serde(default = "default_loss_type")]
    pub loss_type: LossType,
}

fn default_beta_schedule() -> BetaScheduleKind {
    BetaScheduleKind::Linear
}

fn default_beta_start() -> f64 {
    1e-4
}

fn default_beta_end() -> f64 {
    0.02
}

fn default_num_diffusion_timesteps() -> usize {
    1000
}

fn default_loss_type() -> LossType {
    LossType::NoisePred
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            beta_schedule: default_beta_schedule(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            num_diffusion_timesteps: default_num_diffusion_timesteps(),
            loss_type: default_loss_type(),
        }
    }
}

impl DiffusionConfig {
    /// Create a configuration for the given schedule and number of steps
    pub fn new(beta_schedule: BetaScheduleKind, num_diffusion_timesteps: usize) -> Self {
        Self {
            beta_schedule,
            num_diffusion_timesteps,
            ..Default::default()
        }
    }

    /// Set the beta range
    pub fn with_beta_range(mut self, beta_start: f64, beta_end: f64) -> Self {
        self.beta_start = beta_start;
        self.beta_end = beta_end;
        self
    }

    /// Set the loss type
    pub fn with_loss_type(mut self, loss_type: impl Into<LossType>) -> Self {
        self.loss_type = loss_type.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_diffusion_timesteps == 0 {
            return Err(DiffusionError::EmptySchedule);
        }
        Ok(())
    }

    /// Evaluate the configured beta schedule
    pub fn betas(&self) -> Result<Vec<f64>> {
        self.validate()?;
        get_beta_schedule(
            self.beta_schedule,
            self.beta_start,
            self.beta_end,
            self.num_diffusion_timesteps,
        )
    }
}
