//! Backend session orchestration.

use accelmul_backend_cpu::runtime::{CpuExecutor, CpuExecutorOptions};
use accelmul_backend_gpu::{DeviceContext, GpuDeviceInfo, GpuExecutor, GpuOptions};
use accelmul_kernels::backend::DynMatvecBackend;
use accelmul_kernels::config::{MatvecProblem, RowDotProblem};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendTarget {
    #[default]
    Cpu,
    Gpu,
}

impl BackendTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendTarget::Cpu => "cpu",
            BackendTarget::Gpu => "gpu",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub target: BackendTarget,
    pub cpu: CpuExecutorOptions,
    pub gpu: GpuOptions,
    /// Resolve the device once and share it across calls instead of
    /// resolving it inside every call.
    pub reuse_device: bool,
}

/// Output of one timed backend call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: Vec<f32>,
    pub kernel: &'static str,
    pub latency_ms: f64,
}

pub struct AccelSession {
    target: BackendTarget,
    backend: DynMatvecBackend,
    device: Option<GpuDeviceInfo>,
}

impl AccelSession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        let (backend, device): (DynMatvecBackend, Option<GpuDeviceInfo>) = match options.target {
            BackendTarget::Cpu => (Arc::new(CpuExecutor::with_options(options.cpu)), None),
            BackendTarget::Gpu if options.reuse_device => {
                let ctx = DeviceContext::resolve_with(&options.gpu)
                    .context("resolving shared compute device")?;
                let info = ctx.info().clone();
                (Arc::new(GpuExecutor::with_context(Arc::new(ctx))), Some(info))
            }
            BackendTarget::Gpu => (Arc::new(GpuExecutor::per_call(options.gpu)), None),
        };
        info!(
            target = options.target.as_str(),
            backend = backend.name(),
            shared_device = device.as_ref().map(|d| d.name.as_str()),
            "session ready"
        );
        Ok(Self {
            target: options.target,
            backend,
            device,
        })
    }

    /// Wraps an existing backend, e.g. a test double.
    pub fn from_backend(target: BackendTarget, backend: DynMatvecBackend) -> Self {
        Self {
            target,
            backend,
            device: None,
        }
    }

    pub fn target(&self) -> BackendTarget {
        self.target
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Info of the shared device, when the session holds one.
    pub fn device_info(&self) -> Option<&GpuDeviceInfo> {
        self.device.as_ref()
    }

    pub fn execute_matvecmul(
        &self,
        problem: MatvecProblem,
        matrix: &[f32],
        vector: &[f32],
    ) -> Result<ExecutionResult> {
        self.timed(|backend| {
            backend
                .matvecmul(matrix, vector, problem.rows, problem.cols)
                .with_context(|| {
                    format!(
                        "{} matvecmul {}x{} failed",
                        backend.name(),
                        problem.rows,
                        problem.cols
                    )
                })
        })
    }

    pub fn execute_matmul(
        &self,
        problem: RowDotProblem,
        a: &[f32],
        b: &[f32],
    ) -> Result<ExecutionResult> {
        self.timed(|backend| {
            backend
                .matmul(a, b, problem.result_len, problem.a_len)
                .with_context(|| {
                    format!(
                        "{} matmul result_len={} a_len={} failed",
                        backend.name(),
                        problem.result_len,
                        problem.a_len
                    )
                })
        })
    }

    fn timed<F>(&self, f: F) -> Result<ExecutionResult>
    where
        F: FnOnce(&DynMatvecBackend) -> Result<Vec<f32>>,
    {
        let start = Instant::now();
        let output = f(&self.backend)?;
        Ok(ExecutionResult {
            output,
            kernel: self.backend.name(),
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}
