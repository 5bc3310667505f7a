//! Problem configuration structures.

use serde::{Deserialize, Serialize};

/// Width in bytes of the only supported element type.
pub const F32_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Row-major `rows x cols` matrix times a length-`cols` vector.
    Matvecmul,
    /// Length-`a_len` vector against every row of a `result_len x a_len` matrix.
    Matmul,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Matvecmul => "matvecmul",
            Operation::Matmul => "matmul",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatvecProblem {
    pub rows: usize,
    pub cols: usize,
}

impl MatvecProblem {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// `None` when `rows * cols` does not fit in `usize`.
    pub fn matrix_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    pub fn vector_len(&self) -> usize {
        self.cols
    }

    pub fn output_len(&self) -> usize {
        self.rows
    }

    /// True when either dimension is zero and no arithmetic is required.
    pub fn is_degenerate(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.rows as f64 * self.cols as f64
    }

    pub fn data_footprint_bytes(&self) -> Option<usize> {
        self.matrix_len()?
            .checked_add(self.vector_len())?
            .checked_add(self.output_len())?
            .checked_mul(F32_BYTES)
    }
}

/// Shape of the `matmul` primitive: one dot product of `a` per row of `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowDotProblem {
    pub result_len: usize,
    pub a_len: usize,
}

impl RowDotProblem {
    pub fn new(result_len: usize, a_len: usize) -> Self {
        Self { result_len, a_len }
    }

    /// `None` when `result_len * a_len` does not fit in `usize`.
    pub fn b_len(&self) -> Option<usize> {
        self.result_len.checked_mul(self.a_len)
    }

    pub fn output_len(&self) -> usize {
        self.result_len
    }

    pub fn is_degenerate(&self) -> bool {
        self.result_len == 0 || self.a_len == 0
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.result_len as f64 * self.a_len as f64
    }

    pub fn data_footprint_bytes(&self) -> Option<usize> {
        self.b_len()?
            .checked_add(self.a_len)?
            .checked_add(self.output_len())?
            .checked_mul(F32_BYTES)
    }
}
