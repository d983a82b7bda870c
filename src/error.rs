//! Pipeline error types.

use thiserror::Error;

use crate::backend::BackendError;
use crate::scene::RenderQueue;

/// Errors surfaced by pipeline setup, resizing and stage activation.
///
/// Per-frame rendering only fails on device errors or when the pipeline
/// is not set up.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// None of the candidate formats for a render target is supported.
    #[error("no supported format for {target}")]
    UnsupportedFormat { target: &'static str },
    #[error("material '{0}' is not registered")]
    MaterialNotFound(String),
    #[error("material '{material}' has no technique for queue {queue:?}")]
    TechniqueNotFound {
        material: String,
        queue: RenderQueue,
    },
    #[error("material '{material}' has no pass '{pass}'")]
    PassNotFound { material: String, pass: String },
    #[error("material '{material}' has no parameter '{parameter}'")]
    ParameterNotFound { material: String, parameter: String },
    /// Setup failed or a resize tore the pipeline down.
    #[error("pipeline is not set up")]
    Inactive,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureFormat;

    #[test]
    fn test_error_display() {
        let err = PipelineError::UnsupportedFormat { target: "depth" };
        assert_eq!(err.to_string(), "no supported format for depth");

        let err: PipelineError = BackendError::UnsupportedFormat(TextureFormat::R32Float).into();
        assert!(err.to_string().contains("R32Float"));
    }
}
