//! Strategy selection for CPU execution.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuStrategy {
    /// Pick per problem from the row count.
    #[default]
    Auto,
    /// BLAS-style `sgemv` with `alpha = 1`, `beta = 0`.
    Gemv,
    /// One rayon task per output row, each summed in increasing column order.
    RowParallel,
}

impl CpuStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            CpuStrategy::Auto => "auto",
            CpuStrategy::Gemv => "gemv",
            CpuStrategy::RowParallel => "row-parallel",
        }
    }
}

pub struct CpuPlanner {
    strategy: CpuStrategy,
    parallel_row_threshold: usize,
}

impl CpuPlanner {
    pub fn new(strategy: CpuStrategy, parallel_row_threshold: usize) -> Self {
        Self {
            strategy,
            parallel_row_threshold,
        }
    }

    /// Resolves `Auto` into a concrete strategy for an output of `rows` elements.
    pub fn plan(&self, rows: usize) -> CpuStrategy {
        match self.strategy {
            CpuStrategy::Auto if rows >= self.parallel_row_threshold => CpuStrategy::RowParallel,
            CpuStrategy::Auto => CpuStrategy::Gemv,
            fixed => fixed,
        }
    }
}
