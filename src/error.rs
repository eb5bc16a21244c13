use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fallos del núcleo de procesamiento. Todos son locales a la operación
/// que los provoca; ninguno deja una máquina de estados indefinida.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineError {
    #[error("requested range starts at {requested:.3}s but oldest retained sample is at {oldest:.3}s")]
    RangeUnavailable { requested: f64, oldest: f64 },

    #[error("calibration needs at least 2 distinct reference weights (got {distinct})")]
    InsufficientCalibrationPoints { distinct: usize },

    #[error("not enough samples collected: expected at least {expected}, got {actual}")]
    InsufficientSamples { expected: usize, actual: usize },

    #[error("jump window cannot be analyzed: {reason}")]
    IncompleteJumpWindow { reason: String },

    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
}

/// Tipo de fallo, tal como se publica en el evento `PipelineError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RangeUnavailable,
    InsufficientCalibrationPoints,
    InsufficientSamples,
    IncompleteJumpWindow,
    PreconditionNotMet,
    InvalidChunk,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::RangeUnavailable { .. } => ErrorKind::RangeUnavailable,
            PipelineError::InsufficientCalibrationPoints { .. } => {
                ErrorKind::InsufficientCalibrationPoints
            }
            PipelineError::InsufficientSamples { .. } => ErrorKind::InsufficientSamples,
            PipelineError::IncompleteJumpWindow { .. } => ErrorKind::IncompleteJumpWindow,
            PipelineError::PreconditionNotMet(_) => ErrorKind::PreconditionNotMet,
            PipelineError::InvalidChunk(_) => ErrorKind::InvalidChunk,
        }
    }

    /// Los fallos de recogida se pueden reintentar sin tocar datos previos
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::InsufficientSamples { .. } | PipelineError::IncompleteJumpWindow { .. }
        )
    }

    pub(crate) fn incomplete(reason: impl Into<String>) -> Self {
        PipelineError::IncompleteJumpWindow {
            reason: reason.into(),
        }
    }

    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        PipelineError::PreconditionNotMet(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
