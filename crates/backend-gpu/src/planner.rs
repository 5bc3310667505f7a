//! GPU planning logic.

use crate::buffers::f32_byte_len;
use crate::dispatch::{DispatchDescriptor, DispatchParams};
use crate::error::{GpuError, GpuResult};
use accelmul_kernels::config::{MatvecProblem, Operation, RowDotProblem};

/// Everything needed to size buffers and launch one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuPlan {
    pub operation: Operation,
    pub params: DispatchParams,
    pub descriptor: DispatchDescriptor,
    pub output_bytes: u64,
}

/// Device limits that bound a plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub max_threadgroups: u32,
    pub max_binding_bytes: u64,
}

impl PlanLimits {
    pub fn from_info(info: &crate::device::GpuDeviceInfo) -> Self {
        Self {
            max_threadgroups: info.max_threadgroups_per_dimension,
            max_binding_bytes: info.max_storage_binding_bytes,
        }
    }
}

pub struct GpuPlanner {
    limits: PlanLimits,
}

impl GpuPlanner {
    pub fn new(limits: PlanLimits) -> Self {
        Self { limits }
    }

    pub fn plan_matvecmul(&self, problem: MatvecProblem, execution_width: u32) -> GpuResult<GpuPlan> {
        self.check_binding("matrix", problem.matrix_len())?;
        self.plan(
            Operation::Matvecmul,
            problem.cols,
            problem.output_len(),
            execution_width,
        )
    }

    pub fn plan_matmul(&self, problem: RowDotProblem, execution_width: u32) -> GpuResult<GpuPlan> {
        self.check_binding("b", problem.b_len())?;
        self.plan(
            Operation::Matmul,
            problem.a_len,
            problem.output_len(),
            execution_width,
        )
    }

    fn plan(
        &self,
        operation: Operation,
        inner: usize,
        outputs: usize,
        execution_width: u32,
    ) -> GpuResult<GpuPlan> {
        let inner = to_u32("inner dimension", inner)?;
        let outputs = to_u32("output length", outputs)?;
        let descriptor =
            DispatchDescriptor::cover(outputs, execution_width, self.limits.max_threadgroups)?;
        Ok(GpuPlan {
            operation,
            params: DispatchParams::new(inner, outputs),
            descriptor,
            output_bytes: f32_byte_len(outputs as usize),
        })
    }

    /// The largest operand bounds what a single storage binding may hold;
    /// it also keeps flat `u32` indices in the kernels from overflowing.
    fn check_binding(&self, what: &str, elements: Option<usize>) -> GpuResult<()> {
        let Some(elements) = elements else {
            return Err(GpuError::DispatchExecutionError(format!(
                "{what} shape overflows usize"
            )));
        };
        let bytes = f32_byte_len(elements);
        if bytes > self.limits.max_binding_bytes {
            return Err(GpuError::DispatchExecutionError(format!(
                "{what} needs {bytes} bytes, device binding limit is {}",
                self.limits.max_binding_bytes
            )));
        }
        to_u32(what, elements).map(|_| ())
    }
}

fn to_u32(what: &str, value: usize) -> GpuResult<u32> {
    u32::try_from(value).map_err(|_| {
        GpuError::DispatchExecutionError(format!("{what} of {value} exceeds 32-bit kernel indexing"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> GpuPlanner {
        GpuPlanner::new(PlanLimits {
            max_threadgroups: 65_535,
            max_binding_bytes: 128 << 20,
        })
    }

    #[test]
    fn matvecmul_plan_has_one_thread_per_row() {
        let plan = planner().plan_matvecmul(MatvecProblem::new(257, 7), 32).unwrap();
        assert_eq!(plan.operation, Operation::Matvecmul);
        assert_eq!(plan.params, DispatchParams::new(7, 257));
        assert_eq!(plan.descriptor.grid, 257);
        assert_eq!(plan.descriptor.threadgroups, 9);
        assert_eq!(plan.output_bytes, 257 * 4);
    }

    #[test]
    fn matmul_plan_reduces_over_a_len() {
        let plan = planner().plan_matmul(RowDotProblem::new(3, 2), 64).unwrap();
        assert_eq!(plan.params, DispatchParams::new(2, 3));
        assert_eq!(plan.descriptor.threadgroups, 1);
    }

    #[test]
    fn operands_beyond_binding_limit_are_rejected() {
        let planner = GpuPlanner::new(PlanLimits {
            max_threadgroups: 65_535,
            max_binding_bytes: 1024,
        });
        let err = planner
            .plan_matvecmul(MatvecProblem::new(64, 64), 32)
            .unwrap_err();
        assert_eq!(err.stage(), "dispatch");
    }

    #[test]
    fn overflowing_shapes_cannot_be_planned() {
        let err = planner()
            .plan_matvecmul(MatvecProblem::new(usize::MAX, 2), 32)
            .unwrap_err();
        assert!(matches!(err, GpuError::DispatchExecutionError(_)));

        let err = planner()
            .plan_matmul(RowDotProblem::new(2, usize::MAX), 64)
            .unwrap_err();
        assert_eq!(err.stage(), "dispatch");
    }
}
