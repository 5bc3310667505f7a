//! The calling convention every backend exposes.

use crate::reference::{reference_matmul, reference_matvecmul};
use anyhow::Result;
use std::sync::Arc;

/// Host-memory in, host-memory out. Operands are row-major f32 slices
/// whose lengths must agree with the explicit dimensions.
pub trait MatvecBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `rows x cols` matrix times a length-`cols` vector.
    fn matvecmul(&self, matrix: &[f32], vector: &[f32], rows: usize, cols: usize)
        -> Result<Vec<f32>>;

    /// Length-`a_len` vector `a` dotted with each of the `result_len` rows of `b`.
    fn matmul(&self, a: &[f32], b: &[f32], result_len: usize, a_len: usize) -> Result<Vec<f32>>;
}

pub type DynMatvecBackend = Arc<dyn MatvecBackend>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MatvecBackend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn matvecmul(
        &self,
        matrix: &[f32],
        vector: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>> {
        reference_matvecmul(matrix, vector, rows, cols)
    }

    fn matmul(&self, a: &[f32], b: &[f32], result_len: usize, a_len: usize) -> Result<Vec<f32>> {
        reference_matmul(a, b, result_len, a_len)
    }
}
