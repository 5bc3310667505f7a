//! Failure taxonomy of the GPU dispatch pipeline.

use thiserror::Error;

pub type GpuResult<T> = std::result::Result<T, GpuError>;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no compute accelerator available: {0}")]
    DeviceUnavailable(String),

    #[error("kernel `{program}` failed to compile:\n{diagnostic}")]
    KernelCompileError { program: String, diagnostic: String },

    #[error("kernel `{program}` has no compute entry point named `{entry_point}`")]
    KernelSymbolNotFound { program: String, entry_point: String },

    #[error("pipeline creation for kernel `{program}` failed: {diagnostic}")]
    PipelineCreationError { program: String, diagnostic: String },

    #[error("size mismatch for {what}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("compute dispatch failed: {0}")]
    DispatchExecutionError(String),
}

impl GpuError {
    /// Name of the pipeline stage that produced the error.
    pub fn stage(&self) -> &'static str {
        match self {
            GpuError::DeviceUnavailable(_) => "device",
            GpuError::KernelCompileError { .. } => "compile",
            GpuError::KernelSymbolNotFound { .. } => "link",
            GpuError::PipelineCreationError { .. } => "pipeline",
            GpuError::SizeMismatch { .. } => "transfer",
            GpuError::DispatchExecutionError(_) => "dispatch",
        }
    }

    /// Fatal errors are defects in the embedded kernels, the host
    /// environment or the device. The other two are caller-side: a missing
    /// accelerator (fall back to the CPU backend) or mis-sized operands.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            GpuError::DeviceUnavailable(_) | GpuError::SizeMismatch { .. }
        )
    }

    pub(crate) fn size_mismatch(what: &'static str, expected: u64, actual: u64) -> Self {
        GpuError::SizeMismatch {
            what,
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_stage() {
        let compile = GpuError::KernelCompileError {
            program: "matvecmul".into(),
            diagnostic: "expected `)`".into(),
        };
        assert_eq!(compile.stage(), "compile");
        assert!(compile.is_fatal());
        assert!(compile.to_string().contains("expected `)`"));

        let missing = GpuError::DeviceUnavailable("no adapter".into());
        assert!(!missing.is_fatal());

        let mismatch = GpuError::size_mismatch("matrix", 24, 20);
        assert_eq!(mismatch.stage(), "transfer");
        assert!(!mismatch.is_fatal());
        assert_eq!(
            mismatch.to_string(),
            "size mismatch for matrix: expected 24 bytes, got 20"
        );

        assert!(GpuError::DispatchExecutionError("lost".into()).is_fatal());
    }
}
