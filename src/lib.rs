//! GPU-offloaded matrix-vector primitives.
//!
//! [`matvecmul_accelerated`] multiplies a row-major `rows x cols` matrix by a
//! vector; [`matmul_accelerated`] dots one vector with every row of a
//! row-major matrix. Both run on the default compute device and hand back a
//! fresh host vector. [`CpuExecutor`] offers the same calling convention on
//! the host.

pub use accelmul_backend_cpu as cpu;
pub use accelmul_backend_gpu as gpu;
pub use accelmul_kernels as kernels;

pub use accelmul_backend_cpu::CpuExecutor;
pub use accelmul_backend_gpu::{
    matmul_accelerated, matmul_accelerated_on, matvecmul_accelerated, matvecmul_accelerated_on,
    DeviceContext, GpuError, GpuExecutor, GpuResult,
};
pub use accelmul_kernels::{MatvecBackend, MatvecProblem, RowDotProblem};
