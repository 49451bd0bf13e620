use std::fmt;

#[derive(Debug)]
pub enum CarfacError {
    /// A design input was non-positive, non-finite, or produced an unstable filter.
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    /// State, coefficients, or input were sized for a different channel count.
    ChannelCountMismatch { expected: usize, found: usize },
    /// AGC state built for a different number of stages than its coefficients.
    StageCountMismatch { expected: usize, found: usize },
    /// An input block carried a NaN or infinite sample.
    NonFiniteInput { sample: usize },
    /// Ears driven in lock-step received blocks of different lengths.
    BlockLengthMismatch { expected: usize, found: usize },
    /// The number of input streams differs from the number of ears.
    EarCountMismatch { expected: usize, found: usize },
    Config(serde_json::Error),
}

impl CarfacError {
    pub(crate) fn invalid(name: &'static str, value: f64, reason: &'static str) -> Self {
        CarfacError::InvalidParameter {
            name,
            value,
            reason,
        }
    }
}

impl fmt::Display for CarfacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarfacError::InvalidParameter {
                name,
                value,
                reason,
            } => write!(f, "Invalid parameter '{name}' = {value}: {reason}"),
            CarfacError::ChannelCountMismatch { expected, found } => {
                write!(f, "Channel count mismatch: expected {expected}, found {found}")
            }
            CarfacError::StageCountMismatch { expected, found } => {
                write!(f, "Stage count mismatch: expected {expected}, found {found}")
            }
            CarfacError::NonFiniteInput { sample } => write!(f, "Input sample {sample} is not finite"),
            CarfacError::BlockLengthMismatch { expected, found } => {
                write!(f, "Block length mismatch: expected {expected} samples, found {found}")
            }
            CarfacError::EarCountMismatch { expected, found } => {
                write!(f, "Expected {expected} input streams, found {found}")
            }
            CarfacError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for CarfacError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CarfacError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CarfacError {
    fn from(e: serde_json::Error) -> Self {
        CarfacError::Config(e)
    }
}

/// Reject a frame-major block holding any NaN or infinity, naming its frame.
pub(crate) fn require_finite(samples: &[f64], num_channels: usize) -> Result<(), CarfacError> {
    match samples.iter().position(|x| !x.is_finite()) {
        Some(i) => Err(CarfacError::NonFiniteInput {
            sample: i / num_channels.max(1),
        }),
        None => Ok(()),
    }
}

/// Reject non-finite or non-positive values.
pub(crate) fn require_positive(name: &'static str, value: f64) -> Result<f64, CarfacError> {
    if !value.is_finite() {
        return Err(CarfacError::invalid(name, value, "must be finite"));
    }
    if value <= 0.0 {
        return Err(CarfacError::invalid(name, value, "must be positive"));
    }
    Ok(value)
}
