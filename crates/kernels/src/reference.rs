//! Sequential reference kernels.
//!
//! These walk the inner dimension in increasing order with a single f32
//! accumulator per output, which is the same summation order the GPU
//! kernels use. Backends are checked against them.

use crate::config::{MatvecProblem, RowDotProblem};
use crate::utils::{validate_operand_len, validate_output_len};
use anyhow::Result;

/// `out[i] = sum_j matrix[i * cols + j] * vector[j]`.
pub fn reference_matvecmul(
    matrix: &[f32],
    vector: &[f32],
    rows: usize,
    cols: usize,
) -> Result<Vec<f32>> {
    let problem = MatvecProblem::new(rows, cols);
    validate_operand_len("matrix", problem.matrix_len(), matrix.len())?;
    validate_operand_len("vector", Some(problem.vector_len()), vector.len())?;
    validate_output_len(problem.output_len())?;

    let mut output = vec![0.0f32; problem.output_len()];
    for (row, out) in output.iter_mut().enumerate() {
        let base = row * cols;
        let mut sum = 0.0f32;
        for col in 0..cols {
            sum += matrix[base + col] * vector[col];
        }
        *out = sum;
    }
    Ok(output)
}

/// `out[i] = sum_k a[k] * b[i * a_len + k]`.
///
/// Despite the name this is a vector against each row of `b`, not a
/// general matrix product.
pub fn reference_matmul(a: &[f32], b: &[f32], result_len: usize, a_len: usize) -> Result<Vec<f32>> {
    let problem = RowDotProblem::new(result_len, a_len);
    validate_operand_len("a", Some(problem.a_len), a.len())?;
    validate_operand_len("b", problem.b_len(), b.len())?;
    validate_output_len(problem.output_len())?;

    let mut output = vec![0.0f32; problem.output_len()];
    for (row, out) in output.iter_mut().enumerate() {
        let base = row * a_len;
        let mut sum = 0.0f32;
        for k in 0..a_len {
            sum += a[k] * b[base + k];
        }
        *out = sum;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATRIX: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    #[test]
    fn matvecmul_small_example() {
        let out = reference_matvecmul(&MATRIX, &[1.0, 1.0], 3, 2).unwrap();
        assert_eq!(out, vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn matmul_uses_row_stride_of_a_len() {
        let out = reference_matmul(&[1.0, 1.0], &MATRIX, 3, 2).unwrap();
        assert_eq!(out, vec![3.0, 7.0, 11.0]);

        let out = reference_matmul(&[2.0, -1.0], &MATRIX, 3, 2).unwrap();
        assert_eq!(out, vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn empty_inner_dimension_yields_zeros() {
        assert_eq!(reference_matvecmul(&[], &[], 4, 0).unwrap(), vec![0.0; 4]);
        assert!(reference_matmul(&[], &[], 0, 0).unwrap().is_empty());
    }

    #[test]
    fn rejects_short_operands() {
        let err = reference_matvecmul(&MATRIX[..5], &[1.0, 1.0], 3, 2).unwrap_err();
        assert!(err.to_string().contains("matrix"));
        assert!(reference_matmul(&[1.0], &MATRIX, 3, 2).is_err());
    }

    #[test]
    fn rejects_shapes_that_overflow() {
        let err = reference_matvecmul(&[1.0; 4], &[1.0, 1.0], usize::MAX, 2).unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert!(reference_matmul(&[], &[], usize::MAX, 0).is_err());
    }
}
