//! Error types for the diffusion engine

/// Errors raised by schedule construction, configuration dispatch and
/// tensor preconditions.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    #[error("Unsupported beta schedule: {0}")]
    UnsupportedSchedule(String),

    #[error("Unsupported loss type: {0}")]
    UnsupportedLossType(String),

    #[error("Beta schedule is empty (num_diffusion_timesteps must be > 0)")]
    EmptySchedule,

    #[error("Beta at index {index} is {value}, must lie in (0, 1]")]
    BetaOutOfRange { index: usize, value: f64 },

    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("DType mismatch for {what}: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        what: &'static str,
        expected: candle_core::DType,
        got: candle_core::DType,
    },

    #[error("Timestep batch has {got} entries but sample batch size is {expected}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("Timestep {t} out of range for {num_timesteps} diffusion steps")]
    TimestepOutOfRange { t: i64, num_timesteps: usize },

    #[error("Expected a rank-{expected} tensor, got shape {got:?}")]
    InvalidRank { expected: usize, got: Vec<usize> },

    #[error("Timesteps must be an integer tensor, got {0:?}")]
    InvalidTimestepDType(candle_core::DType),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
