//! CPU runtime entrypoints.

use crate::planner::{CpuPlanner, CpuStrategy};
use accelmul_kernels::backend::MatvecBackend;
use accelmul_kernels::config::{MatvecProblem, RowDotProblem};
use accelmul_kernels::utils::{validate_operand_len, validate_output_len};
use anyhow::{Context, Result};
use ndarray::linalg::general_mat_vec_mul;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CpuExecutorOptions {
    pub strategy: CpuStrategy,
    /// Row count at which `Auto` moves from gemv to the row-parallel path.
    pub parallel_row_threshold: usize,
}

impl Default for CpuExecutorOptions {
    fn default() -> Self {
        Self {
            strategy: CpuStrategy::Auto,
            parallel_row_threshold: 4096,
        }
    }
}

pub struct CpuExecutor {
    planner: CpuPlanner,
}

impl CpuExecutor {
    pub fn new(planner: CpuPlanner) -> Self {
        Self { planner }
    }

    pub fn with_options(options: CpuExecutorOptions) -> Self {
        Self::new(CpuPlanner::new(
            options.strategy,
            options.parallel_row_threshold,
        ))
    }

    /// Same contract as `cblas_sgemv(RowMajor, NoTrans, rows, cols, 1, A, cols, x, 1, 0, y, 1)`.
    pub fn execute_matvecmul(
        &self,
        matrix: &[f32],
        vector: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>> {
        let problem = MatvecProblem::new(rows, cols);
        validate_operand_len("matrix", problem.matrix_len(), matrix.len())?;
        validate_operand_len("vector", Some(problem.vector_len()), vector.len())?;
        validate_output_len(problem.output_len())?;

        let strategy = self.planner.plan(rows);
        debug!(rows, cols, strategy = strategy.name(), "executing cpu matvecmul");
        row_major_gemv(strategy, matrix, vector, rows, cols)
    }

    /// `b` is `result_len x a_len`, so this is gemv with `b` as the matrix.
    pub fn execute_matmul(
        &self,
        a: &[f32],
        b: &[f32],
        result_len: usize,
        a_len: usize,
    ) -> Result<Vec<f32>> {
        let problem = RowDotProblem::new(result_len, a_len);
        validate_operand_len("a", Some(problem.a_len), a.len())?;
        validate_operand_len("b", problem.b_len(), b.len())?;
        validate_output_len(problem.output_len())?;

        let strategy = self.planner.plan(result_len);
        debug!(result_len, a_len, strategy = strategy.name(), "executing cpu matmul");
        row_major_gemv(strategy, b, a, result_len, a_len)
    }
}

impl Default for CpuExecutor {
    fn default() -> Self {
        Self::with_options(CpuExecutorOptions::default())
    }
}

impl MatvecBackend for CpuExecutor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn matvecmul(
        &self,
        matrix: &[f32],
        vector: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>> {
        self.execute_matvecmul(matrix, vector, rows, cols)
    }

    fn matmul(&self, a: &[f32], b: &[f32], result_len: usize, a_len: usize) -> Result<Vec<f32>> {
        self.execute_matmul(a, b, result_len, a_len)
    }
}

fn row_major_gemv(
    strategy: CpuStrategy,
    matrix: &[f32],
    vector: &[f32],
    rows: usize,
    cols: usize,
) -> Result<Vec<f32>> {
    match strategy {
        CpuStrategy::Gemv | CpuStrategy::Auto => {
            let matrix = ArrayView2::from_shape((rows, cols), matrix)
                .context("matrix does not match a row-major rows x cols layout")?;
            let vector = ArrayView1::from(vector);
            let mut output = Array1::<f32>::zeros(rows);
            general_mat_vec_mul(1.0, &matrix, &vector, 0.0, &mut output);
            Ok(output.into_raw_vec())
        }
        CpuStrategy::RowParallel => {
            let mut output = vec![0.0f32; rows];
            if cols == 0 {
                return Ok(output);
            }
            output
                .par_iter_mut()
                .zip(matrix.par_chunks_exact(cols))
                .for_each(|(out, row)| {
                    *out = row
                        .iter()
                        .zip(vector)
                        .fold(0.0f32, |acc, (m, v)| acc + m * v);
                });
            Ok(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelmul_kernels::reference::{reference_matmul, reference_matvecmul};
    use accelmul_kernels::utils::{bit_identical, compare_outputs, deterministic_values};

    const MATRIX: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    fn executors() -> Vec<CpuExecutor> {
        [CpuStrategy::Gemv, CpuStrategy::RowParallel]
            .into_iter()
            .map(|strategy| {
                CpuExecutor::with_options(CpuExecutorOptions {
                    strategy,
                    ..CpuExecutorOptions::default()
                })
            })
            .collect()
    }

    #[test]
    fn small_example_on_every_strategy() {
        for executor in executors() {
            let out = executor.execute_matvecmul(&MATRIX, &[1.0, 1.0], 3, 2).unwrap();
            assert_eq!(out, vec![3.0, 7.0, 11.0]);
            let out = executor.execute_matmul(&[1.0, 1.0], &MATRIX, 3, 2).unwrap();
            assert_eq!(out, vec![3.0, 7.0, 11.0]);
        }
    }

    #[test]
    fn matches_reference_across_shapes() {
        let sizes = [1usize, 2, 7, 64, 257];
        for executor in executors() {
            for &rows in &sizes {
                for &cols in &sizes {
                    let matrix = deterministic_values(rows, cols);
                    let vector = deterministic_values(1, cols);
                    let expected = reference_matvecmul(&matrix, &vector, rows, cols).unwrap();
                    let actual = executor.execute_matvecmul(&matrix, &vector, rows, cols).unwrap();
                    let cmp = compare_outputs(&actual, &expected).unwrap();
                    assert!(cmp.within(1e-4), "{rows}x{cols}: {cmp:?}");

                    let expected = reference_matmul(&vector, &matrix, rows, cols).unwrap();
                    let actual = executor.execute_matmul(&vector, &matrix, rows, cols).unwrap();
                    assert!(compare_outputs(&actual, &expected).unwrap().within(1e-4));
                }
            }
        }
    }

    #[test]
    fn row_parallel_keeps_reference_summation_order() {
        let executor = CpuExecutor::with_options(CpuExecutorOptions {
            strategy: CpuStrategy::RowParallel,
            ..CpuExecutorOptions::default()
        });
        let matrix = deterministic_values(64, 257);
        let vector = deterministic_values(1, 257);
        let expected = reference_matvecmul(&matrix, &vector, 64, 257).unwrap();
        let actual = executor.execute_matvecmul(&matrix, &vector, 64, 257).unwrap();
        assert!(bit_identical(&actual, &expected));
    }

    #[test]
    fn zero_dimensions_return_zeros() {
        for executor in executors() {
            assert!(executor.execute_matvecmul(&[], &[1.0], 0, 1).unwrap().is_empty());
            assert_eq!(executor.execute_matvecmul(&[], &[], 3, 0).unwrap(), vec![0.0; 3]);
        }
    }

    #[test]
    fn rejects_mismatched_operands() {
        let executor = CpuExecutor::default();
        assert!(executor.execute_matvecmul(&MATRIX, &[1.0], 3, 2).is_err());
        assert!(executor.execute_matmul(&[1.0, 1.0], &MATRIX[..4], 3, 2).is_err());
    }

    #[test]
    fn rejects_shapes_that_overflow() {
        let executor = CpuExecutor::default();
        assert!(executor.execute_matvecmul(&[1.0; 4], &[1.0, 1.0], usize::MAX, 2).is_err());
        assert!(executor.execute_matmul(&[1.0; 4], &[], 0, usize::MAX / 2).is_err());
        assert!(executor.execute_matvecmul(&[], &[], usize::MAX, 0).is_err());
    }
}
