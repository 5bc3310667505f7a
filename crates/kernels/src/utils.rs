//! Shared helpers for backends and their tests.

use crate::config::F32_BYTES;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// `expected` is `None` when the declared shape overflows `usize`; no
/// slice can satisfy such a shape.
pub fn validate_operand_len(name: &str, expected: Option<usize>, actual: usize) -> Result<()> {
    let Some(expected) = expected else {
        bail!("{name} holds {actual} elements but the declared shape overflows usize");
    };
    if expected != actual {
        bail!("{name} holds {actual} elements but the declared shape needs {expected}");
    }
    Ok(())
}

/// Rejects output lengths whose f32 storage exceeds what a `Vec` may hold.
pub fn validate_output_len(len: usize) -> Result<()> {
    let fits = len
        .checked_mul(F32_BYTES)
        .is_some_and(|bytes| bytes <= isize::MAX as usize);
    if !fits {
        bail!("output of {len} elements exceeds the host address space");
    }
    Ok(())
}

/// Deterministic, strictly positive operand data in `[1, 2)`.
pub fn deterministic_values(rows: usize, cols: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(rows * cols);
    for row_idx in 0..rows {
        for col_idx in 0..cols {
            let seed = ((row_idx * 1313) ^ (col_idx * 7331)) as f32;
            values.push(1.0 + (seed % 17.0) / 16.0);
        }
    }
    values
}

/// Expected magnitudes below this are treated as this value when computing
/// relative error, so exact zeros compare on absolute error at f32 epsilon.
pub const REL_ERROR_FLOOR: f64 = f32::EPSILON as f64;

/// Error summary of one output against its reference.
///
/// A `NaN` or infinite difference is recorded as `f64::MAX`, which fails
/// every tolerance and still serializes as a number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputComparison {
    pub max_abs_error: f64,
    pub mean_abs_error: f64,
    /// Largest `|actual - expected| / max(|expected|, REL_ERROR_FLOOR)`.
    pub max_rel_error: f64,
}

impl OutputComparison {
    pub fn within(&self, rel_tolerance: f64) -> bool {
        self.max_rel_error <= rel_tolerance
    }
}

pub fn compare_outputs(actual: &[f32], expected: &[f32]) -> Result<OutputComparison> {
    validate_operand_len("output", Some(expected.len()), actual.len())?;
    if actual.is_empty() {
        return Ok(OutputComparison::default());
    }

    let mut comparison = OutputComparison::default();
    let mut abs_sum = 0.0f64;
    for (&a, &e) in actual.iter().zip(expected) {
        let (abs, rel) = element_error(a as f64, e as f64);
        comparison.max_abs_error = comparison.max_abs_error.max(abs);
        comparison.max_rel_error = comparison.max_rel_error.max(rel);
        abs_sum += abs;
    }
    comparison.mean_abs_error = (abs_sum / actual.len() as f64).min(f64::MAX);
    Ok(comparison)
}

fn element_error(actual: f64, expected: f64) -> (f64, f64) {
    if actual == expected {
        return (0.0, 0.0);
    }
    let abs = (actual - expected).abs();
    if !abs.is_finite() {
        return (f64::MAX, f64::MAX);
    }
    (abs, abs / expected.abs().max(REL_ERROR_FLOOR))
}

/// Bitwise equality, so `NaN` payloads and signed zeros count as differences.
pub fn bit_identical(lhs: &[f32], rhs: &[f32]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(a, b)| a.to_bits() == b.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn deterministic_values_are_stable_and_bounded() {
        let first = deterministic_values(7, 5);
        let second = deterministic_values(7, 5);
        assert_eq!(first.len(), 35);
        assert!(bit_identical(&first, &second));
        assert!(first.iter().all(|v| (1.0..2.0).contains(v)));
    }

    #[test]
    fn comparison_reports_relative_error() {
        let cmp = compare_outputs(&[100.01, 2.0], &[100.0, 2.0]).unwrap();
        assert_abs_diff_eq!(cmp.max_abs_error, 0.01, epsilon = 1e-4);
        assert_abs_diff_eq!(cmp.max_rel_error, 1e-4, epsilon = 1e-5);
        assert!(!cmp.within(1e-5));
        assert!(cmp.within(1e-3));
    }

    #[test]
    fn comparison_fails_on_non_finite_results() {
        let cmp = compare_outputs(&[f32::NAN, 2.0], &[1.0, 2.0]).unwrap();
        assert_eq!(cmp.max_rel_error, f64::MAX);
        assert!(cmp.mean_abs_error.is_finite());
        assert!(!cmp.within(1e-4));

        assert!(!compare_outputs(&[f32::INFINITY], &[1.0]).unwrap().within(1e-4));
        assert!(!compare_outputs(&[1.0], &[f32::NAN]).unwrap().within(1e-4));
        assert!(compare_outputs(&[f32::INFINITY], &[f32::INFINITY]).unwrap().within(0.0));
    }

    #[test]
    fn small_expected_values_use_true_relative_error() {
        let cmp = compare_outputs(&[0.2501], &[0.25]).unwrap();
        assert_abs_diff_eq!(cmp.max_rel_error, 4e-4, epsilon = 1e-5);
        assert!(!cmp.within(1e-4));

        // Exact zeros fall back to the floor.
        let cmp = compare_outputs(&[1e-9], &[0.0]).unwrap();
        assert!(cmp.within(1e-2));
    }

    #[test]
    fn comparison_rejects_length_mismatch() {
        assert!(compare_outputs(&[1.0], &[1.0, 2.0]).is_err());
        assert_eq!(compare_outputs(&[], &[]).unwrap(), OutputComparison::default());
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let err = validate_operand_len("matrix", None, 4).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn unallocatable_outputs_are_rejected() {
        assert!(validate_output_len(1 << 20).is_ok());
        assert!(validate_output_len(usize::MAX).is_err());
        assert!(validate_output_len(usize::MAX / 4).is_err());
    }

    #[test]
    fn bit_identical_distinguishes_signed_zero() {
        assert!(bit_identical(&[1.0, 2.0], &[1.0, 2.0]));
        assert!(!bit_identical(&[0.0], &[-0.0]));
        assert!(!bit_identical(&[1.0], &[1.0, 1.0]));
    }
}
