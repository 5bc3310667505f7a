//! GPU runtime entrypoints.
//!
//! Each call opens a [`ResourceScope`], resolves (or borrows) a device,
//! compiles its kernel, uploads operands, dispatches one compute pass,
//! waits for it and downloads the result. Nothing survives the call.

use crate::buffers::{f32_byte_len, BufferManager, DeviceBuffer};
use crate::device::{DeviceContext, GpuOptions};
use crate::dispatch::dispatch;
use crate::error::{GpuError, GpuResult};
use crate::planner::{GpuPlan, GpuPlanner, PlanLimits};
use crate::program::KernelProgram;
use crate::scope::{ResourceScope, ScopeLedger};
use accelmul_kernels::backend::MatvecBackend;
use accelmul_kernels::config::{MatvecProblem, Operation, RowDotProblem};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `rows x cols` row-major matrix times a length-`cols` vector, on a device
/// resolved for this call only.
pub fn matvecmul_accelerated(
    matrix: &[f32],
    vector: &[f32],
    rows: usize,
    cols: usize,
) -> GpuResult<Vec<f32>> {
    GpuExecutor::default().matvecmul(matrix, vector, rows, cols)
}

/// `out[i] = sum_k a[k] * b[i * a_len + k]` for `i < result_len`, on a
/// device resolved for this call only.
pub fn matmul_accelerated(
    a: &[f32],
    b: &[f32],
    result_len: usize,
    a_len: usize,
) -> GpuResult<Vec<f32>> {
    GpuExecutor::default().matmul(a, b, result_len, a_len)
}

pub fn matvecmul_accelerated_on(
    ctx: &DeviceContext,
    matrix: &[f32],
    vector: &[f32],
    rows: usize,
    cols: usize,
) -> GpuResult<Vec<f32>> {
    let call = OperationCall::matvecmul(matrix, vector, rows, cols)?;
    run_operation(DeviceSource::Borrowed(ctx), None, &KernelProgram::matvecmul(), &call)
}

pub fn matmul_accelerated_on(
    ctx: &DeviceContext,
    a: &[f32],
    b: &[f32],
    result_len: usize,
    a_len: usize,
) -> GpuResult<Vec<f32>> {
    let call = OperationCall::matmul(a, b, result_len, a_len)?;
    run_operation(DeviceSource::Borrowed(ctx), None, &KernelProgram::matmul(), &call)
}

/// GPU implementation of [`MatvecBackend`].
///
/// Without a shared context the device is resolved afresh on every call.
#[derive(Clone, Default)]
pub struct GpuExecutor {
    context: Option<Arc<DeviceContext>>,
    options: GpuOptions,
    ledger: Option<ScopeLedger>,
}

impl GpuExecutor {
    pub fn per_call(options: GpuOptions) -> Self {
        Self {
            context: None,
            options,
            ledger: None,
        }
    }

    pub fn with_context(context: Arc<DeviceContext>) -> Self {
        Self {
            context: Some(context),
            options: GpuOptions::default(),
            ledger: None,
        }
    }

    /// Every scope opened by this executor reports into `ledger`.
    pub fn with_ledger(mut self, ledger: ScopeLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn matvecmul(
        &self,
        matrix: &[f32],
        vector: &[f32],
        rows: usize,
        cols: usize,
    ) -> GpuResult<Vec<f32>> {
        self.matvecmul_with_program(&KernelProgram::matvecmul(), matrix, vector, rows, cols)
    }

    pub fn matmul(
        &self,
        a: &[f32],
        b: &[f32],
        result_len: usize,
        a_len: usize,
    ) -> GpuResult<Vec<f32>> {
        let call = OperationCall::matmul(a, b, result_len, a_len)?;
        self.run(&KernelProgram::matmul(), &call)
    }

    /// Runs the matvecmul pipeline with a substitute program. The program
    /// must declare the matvecmul slot layout.
    pub fn matvecmul_with_program(
        &self,
        program: &KernelProgram,
        matrix: &[f32],
        vector: &[f32],
        rows: usize,
        cols: usize,
    ) -> GpuResult<Vec<f32>> {
        let call = OperationCall::matvecmul(matrix, vector, rows, cols)?;
        self.run(program, &call)
    }

    fn run(&self, program: &KernelProgram, call: &OperationCall<'_>) -> GpuResult<Vec<f32>> {
        let source = match &self.context {
            Some(ctx) => DeviceSource::Borrowed(ctx),
            None => DeviceSource::Resolve(&self.options),
        };
        run_operation(source, self.ledger.as_ref(), program, call)
    }
}

impl MatvecBackend for GpuExecutor {
    fn name(&self) -> &'static str {
        "gpu-wgpu"
    }

    fn matvecmul(
        &self,
        matrix: &[f32],
        vector: &[f32],
        rows: usize,
        cols: usize,
    ) -> anyhow::Result<Vec<f32>> {
        Ok(GpuExecutor::matvecmul(self, matrix, vector, rows, cols)?)
    }

    fn matmul(
        &self,
        a: &[f32],
        b: &[f32],
        result_len: usize,
        a_len: usize,
    ) -> anyhow::Result<Vec<f32>> {
        Ok(GpuExecutor::matmul(self, a, b, result_len, a_len)?)
    }
}

enum DeviceSource<'a> {
    Borrowed(&'a DeviceContext),
    Resolve(&'a GpuOptions),
}

enum Slot<'a> {
    Input {
        label: &'static str,
        data: &'a [f32],
    },
    Output,
}

/// One validated call: operands in kernel slot order plus its shape.
struct OperationCall<'a> {
    operation: Operation,
    slots: [Slot<'a>; 3],
    inner: usize,
    outputs: usize,
}

impl<'a> OperationCall<'a> {
    fn matvecmul(matrix: &'a [f32], vector: &'a [f32], rows: usize, cols: usize) -> GpuResult<Self> {
        let problem = MatvecProblem::new(rows, cols);
        check_operand("matrix", problem.matrix_len(), matrix)?;
        check_operand("vector", Some(problem.vector_len()), vector)?;
        check_output(problem.output_len())?;
        Ok(Self {
            operation: Operation::Matvecmul,
            slots: [
                Slot::Input {
                    label: "matrix",
                    data: matrix,
                },
                Slot::Input {
                    label: "vector",
                    data: vector,
                },
                Slot::Output,
            ],
            inner: cols,
            outputs: rows,
        })
    }

    fn matmul(a: &'a [f32], b: &'a [f32], result_len: usize, a_len: usize) -> GpuResult<Self> {
        let problem = RowDotProblem::new(result_len, a_len);
        check_operand("a", Some(problem.a_len), a)?;
        check_operand("b", problem.b_len(), b)?;
        check_output(problem.output_len())?;
        Ok(Self {
            operation: Operation::Matmul,
            slots: [
                Slot::Output,
                Slot::Input {
                    label: "a",
                    data: a,
                },
                Slot::Input {
                    label: "b",
                    data: b,
                },
            ],
            inner: a_len,
            outputs: result_len,
        })
    }

    fn is_degenerate(&self) -> bool {
        self.inner == 0 || self.outputs == 0
    }

    fn plan(&self, planner: &GpuPlanner, execution_width: u32) -> GpuResult<GpuPlan> {
        match self.operation {
            Operation::Matvecmul => planner.plan_matvecmul(
                MatvecProblem::new(self.outputs, self.inner),
                execution_width,
            ),
            Operation::Matmul => {
                planner.plan_matmul(RowDotProblem::new(self.outputs, self.inner), execution_width)
            }
        }
    }
}

/// `expected_elements` is `None` when the declared shape overflows `usize`;
/// no slice can match it.
fn check_operand(
    what: &'static str,
    expected_elements: Option<usize>,
    data: &[f32],
) -> GpuResult<()> {
    let expected = expected_elements.map_or(u64::MAX, f32_byte_len);
    let actual = f32_byte_len(data.len());
    if expected != actual {
        warn!(operand = what, expected, actual, "operand size does not match declared shape");
        return Err(GpuError::size_mismatch(what, expected, actual));
    }
    Ok(())
}

/// The host result vector must fit in a `Vec`, even on the zero-filled path.
fn check_output(outputs: usize) -> GpuResult<()> {
    let needed = f32_byte_len(outputs);
    let limit = isize::MAX as u64;
    if needed > limit {
        warn!(outputs, needed, "output does not fit in host memory");
        return Err(GpuError::size_mismatch("output", needed, limit));
    }
    Ok(())
}

fn run_operation(
    source: DeviceSource<'_>,
    ledger: Option<&ScopeLedger>,
    program: &KernelProgram,
    call: &OperationCall<'_>,
) -> GpuResult<Vec<f32>> {
    // An empty sum is zero and an empty output is empty; neither needs a device.
    if call.is_degenerate() {
        debug!(
            operation = %call.operation,
            outputs = call.outputs,
            inner = call.inner,
            "degenerate shape, skipping dispatch"
        );
        return Ok(vec![0.0; call.outputs]);
    }

    let mut scope = ResourceScope::open(call.operation.as_str());
    if let Some(ledger) = ledger {
        scope = scope.with_ledger(ledger.clone());
    }

    let resolved;
    let ctx: &DeviceContext = match source {
        DeviceSource::Borrowed(ctx) => ctx,
        DeviceSource::Resolve(options) => {
            resolved = scope.adopt(DeviceContext::resolve_with(options)?);
            &*resolved
        }
    };

    let pipeline = program.compile(ctx, &mut scope)?;
    let planner = GpuPlanner::new(PlanLimits::from_info(ctx.info()));
    let plan = call.plan(&planner, pipeline.execution_width())?;

    let manager = BufferManager::new(ctx);
    let mut buffers: Vec<DeviceBuffer> = Vec::with_capacity(call.slots.len());
    let mut output_slot = 0;
    for (index, slot) in call.slots.iter().enumerate() {
        match slot {
            Slot::Input { label, data } => {
                let buffer = manager.allocate(&mut scope, label, f32_byte_len(data.len()));
                manager.upload(&buffer, data)?;
                buffers.push(buffer);
            }
            Slot::Output => {
                buffers.push(manager.allocate(&mut scope, "output", plan.output_bytes));
                output_slot = index;
            }
        }
    }

    let bound: Vec<&DeviceBuffer> = buffers.iter().collect();
    dispatch(ctx, &mut scope, &pipeline, &bound, &plan.params, &plan.descriptor)?;

    let mut output = vec![0.0f32; call.outputs];
    manager.download(&mut scope, &buffers[output_slot], &mut output)?;

    let stats = scope.close();
    info!(
        operation = %plan.operation,
        outputs = call.outputs,
        inner = call.inner,
        threadgroups = plan.descriptor.threadgroups,
        threadgroup_width = plan.descriptor.threadgroup_width,
        released = stats.released,
        "gpu operation completed"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATRIX: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    #[test]
    fn operand_lengths_are_checked_before_touching_a_device() {
        let err = matvecmul_accelerated(&MATRIX[..5], &[1.0, 1.0], 3, 2).unwrap_err();
        match err {
            GpuError::SizeMismatch {
                what,
                expected,
                actual,
            } => {
                assert_eq!(what, "matrix");
                assert_eq!(expected, 24);
                assert_eq!(actual, 20);
            }
            other => panic!("expected size mismatch, got {other:?}"),
        }

        let err = matmul_accelerated(&[1.0, 1.0, 1.0], &MATRIX, 3, 2).unwrap_err();
        assert!(matches!(err, GpuError::SizeMismatch { what: "a", .. }));
    }

    #[test]
    fn overflowing_shapes_are_size_mismatches() {
        let err = matvecmul_accelerated(&[1.0; 4], &[1.0, 1.0], usize::MAX, 2).unwrap_err();
        match err {
            GpuError::SizeMismatch {
                what,
                expected,
                actual,
            } => {
                assert_eq!(what, "matrix");
                assert_eq!(expected, u64::MAX);
                assert_eq!(actual, 16);
            }
            other => panic!("expected size mismatch, got {other:?}"),
        }

        let err = matmul_accelerated(&[1.0; 4], &[], 0, usize::MAX / 2).unwrap_err();
        assert!(matches!(err, GpuError::SizeMismatch { what: "a", .. }));

        // Zero-width rows pass the operand checks but the zeroed result cannot be allocated.
        let err = matvecmul_accelerated(&[], &[], usize::MAX, 0).unwrap_err();
        assert!(matches!(err, GpuError::SizeMismatch { what: "output", .. }));
        let err = matmul_accelerated(&[], &[], usize::MAX / 2, 0).unwrap_err();
        assert!(matches!(err, GpuError::SizeMismatch { what: "output", .. }));
    }

    #[test]
    fn degenerate_shapes_return_zeros_without_a_device() {
        let ledger = ScopeLedger::new();
        let executor = GpuExecutor::default().with_ledger(ledger.clone());

        assert!(executor.matvecmul(&[], &[1.0, 2.0], 0, 2).unwrap().is_empty());
        assert_eq!(executor.matvecmul(&[], &[], 3, 0).unwrap(), vec![0.0; 3]);
        assert_eq!(executor.matmul(&[], &[], 4, 0).unwrap(), vec![0.0; 4]);
        assert!(executor.matmul(&[1.0], &[], 0, 1).unwrap().is_empty());

        assert_eq!(ledger.snapshot().adopted, 0);
    }

    #[test]
    fn call_slots_follow_kernel_order() {
        let call = OperationCall::matmul(&[1.0, 1.0], &MATRIX, 3, 2).unwrap();
        assert!(matches!(call.slots[0], Slot::Output));
        assert!(matches!(call.slots[2], Slot::Input { label: "b", .. }));

        let call = OperationCall::matvecmul(&MATRIX, &[1.0, 1.0], 3, 2).unwrap();
        assert!(matches!(call.slots[0], Slot::Input { label: "matrix", .. }));
        assert!(matches!(call.slots[2], Slot::Output));
    }
}
