//! Renderer error types.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by one-time setup paths (shader programs, render textures)
/// and by backend device failures. Per-frame problems are logged and contained.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("shader {signature} failed to compile: {reason}")]
    ShaderCompile { signature: String, reason: String },
    #[error("shader {signature} does not support multiview (needs gl_ViewID_OVR and GL_OVR_multiview2)")]
    MultiviewUnsupported { signature: String },
    #[error("framebuffer {label} incomplete: {reason}")]
    FramebufferIncomplete { label: String, reason: String },
    #[error("shader {0} not found")]
    MissingShader(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::MultiviewUnsupported {
            signature: "Unlit".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "shader Unlit does not support multiview (needs gl_ViewID_OVR and GL_OVR_multiview2)"
        );

        let err: RenderError = BackendError::OutOfMemory.into();
        assert_eq!(err.to_string(), "Out of memory");
    }
}
