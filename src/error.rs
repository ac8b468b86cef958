//! Error type for the sampling pipeline

/// Errors raised by the pipeline.
///
/// Validation variants are produced before any collaborator is invoked.
/// Collaborator and tensor failures are wrapped transparently and never retried.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("`prompt` has to be a string or a list of strings but is {0}")]
    InvalidPrompt(String),
    #[error("`prompt` list is empty")]
    EmptyPrompt,
    #[error("`height` and `width` have to be divisible by 8 but are {height} and {width}")]
    InvalidDimensions { height: usize, width: usize },
    #[error("the value of strength should be in [0.0, 1.0] but is {0}")]
    InvalidStrength(f64),
    #[error("`num_inference_steps` has to be at least 1 but is {0}")]
    InvalidSteps(usize),
    #[error("seed image of {width}x{height} collapses to zero size when rounded to a multiple of 64")]
    DegenerateImage { width: u32, height: u32 },
    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),
    #[error("unknown output type: {0}")]
    UnknownOutputType(String),
    #[error("invalid device: {0}")]
    InvalidDevice(String),
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl PipelineError {
    /// True for errors raised by input validation rather than by a collaborator.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidPrompt(_)
                | PipelineError::EmptyPrompt
                | PipelineError::InvalidDimensions { .. }
                | PipelineError::InvalidStrength(_)
                | PipelineError::InvalidSteps(_)
                | PipelineError::DegenerateImage { .. }
                | PipelineError::UnknownScheduler(_)
                | PipelineError::UnknownOutputType(_)
                | PipelineError::InvalidDevice(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strength_message_cites_value() {
        let err = PipelineError::InvalidStrength(1.5);
        assert!(err.to_string().contains("1.5"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_collaborator_errors_are_transparent() {
        let err: PipelineError = anyhow::anyhow!("unet exploded").into();
        assert_eq!(err.to_string(), "unet exploded");
        assert!(!err.is_validation());
    }
}
