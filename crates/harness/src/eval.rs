//! Evaluation helpers for matvecmul/matmul accuracy and latency.
//!
//! The suite sweeps both operations over a small grid of shapes that
//! includes odd sizes and sizes that do not divide a threadgroup, checks
//! every result against the sequential reference, repeats each call to
//! confirm the result is bit-identical, and collects the numbers in a
//! JSON report that can be diffed against an earlier run.

use crate::session::AccelSession;
use accelmul_kernels::config::{MatvecProblem, Operation, RowDotProblem};
use accelmul_kernels::reference::{reference_matmul, reference_matvecmul};
use accelmul_kernels::utils::{bit_identical, compare_outputs, deterministic_values};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Relative error allowed against the reference.
pub const DEFAULT_REL_TOLERANCE: f64 = 1e-4;

/// Edge lengths swept for both dimensions.
pub const GRID_SIZES: [usize; 5] = [1, 2, 7, 64, 257];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub name: String,
    pub operation: Operation,
    /// Rows for matvecmul, `result_len` for matmul.
    pub outputs: usize,
    /// Cols for matvecmul, `a_len` for matmul.
    pub inner: usize,
}

impl EvalCase {
    pub fn new(operation: Operation, outputs: usize, inner: usize) -> Self {
        Self {
            name: format!("{operation}_{outputs}x{inner}"),
            operation,
            outputs,
            inner,
        }
    }

    fn flops(&self) -> f64 {
        match self.operation {
            Operation::Matvecmul => MatvecProblem::new(self.outputs, self.inner).flops(),
            Operation::Matmul => RowDotProblem::new(self.outputs, self.inner).flops(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub case: String,
    pub backend: String,
    pub operation: Operation,
    pub outputs: usize,
    pub inner: usize,
    pub latency_ms: f64,
    pub gflops: f64,
    pub max_abs_error: f64,
    pub mean_abs_error: f64,
    pub max_rel_error: f64,
    pub within_tolerance: bool,
    pub deterministic: bool,
}

impl EvalResult {
    /// Key used to pair results across reports.
    pub fn key(&self) -> String {
        format!("{}/{}", self.backend, self.case)
    }

    pub fn passed(&self) -> bool {
        self.within_tolerance && self.deterministic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub generated_at_unix_ms: u128,
    pub rel_tolerance: f64,
    pub backends: Vec<String>,
    pub cases: Vec<EvalResult>,
}

impl EvaluationReport {
    pub fn as_map(&self) -> BTreeMap<String, &EvalResult> {
        self.cases.iter().map(|case| (case.key(), case)).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EvalResult> {
        self.cases.iter().filter(|case| !case.passed())
    }

    pub fn all_passed(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn diff<'a>(&'a self, baseline: &'a EvaluationReport) -> BTreeMap<String, EvaluationDelta<'a>> {
        let previous = baseline.as_map();
        self.as_map()
            .into_iter()
            .filter_map(|(key, result)| {
                let baseline_result = *previous.get(&key)?;
                Some((
                    key,
                    EvaluationDelta {
                        current: result,
                        baseline: baseline_result,
                        latency_ms_delta: result.latency_ms - baseline_result.latency_ms,
                        gflops_delta: result.gflops - baseline_result.gflops,
                    },
                ))
            })
            .collect()
    }

    /// Folds the cases of `other` into this report.
    pub fn merge(&mut self, other: EvaluationReport) {
        for backend in other.backends {
            if !self.backends.contains(&backend) {
                self.backends.push(backend);
            }
        }
        self.cases.extend(other.cases);
    }
}

#[derive(Debug)]
pub struct EvaluationDelta<'a> {
    pub current: &'a EvalResult,
    pub baseline: &'a EvalResult,
    pub latency_ms_delta: f64,
    pub gflops_delta: f64,
}

pub struct EvaluationSuite {
    cases: Vec<EvalCase>,
    rel_tolerance: f64,
}

impl EvaluationSuite {
    pub fn new(cases: Vec<EvalCase>) -> Self {
        Self {
            cases,
            rel_tolerance: DEFAULT_REL_TOLERANCE,
        }
    }

    /// Every `(outputs, inner)` pair of [`GRID_SIZES`] for both operations.
    pub fn accuracy_grid() -> Self {
        let mut cases = Vec::with_capacity(2 * GRID_SIZES.len() * GRID_SIZES.len());
        for operation in [Operation::Matvecmul, Operation::Matmul] {
            for &outputs in &GRID_SIZES {
                for &inner in &GRID_SIZES {
                    cases.push(EvalCase::new(operation, outputs, inner));
                }
            }
        }
        Self::new(cases)
    }

    pub fn with_tolerance(mut self, rel_tolerance: f64) -> Self {
        self.rel_tolerance = rel_tolerance;
        self
    }

    pub fn cases(&self) -> &[EvalCase] {
        &self.cases
    }

    pub fn run(&self, session: &AccelSession) -> Result<EvaluationReport> {
        let mut results = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let result = self.run_case(session, case)?;
            if !result.passed() {
                warn!(
                    case = %result.case,
                    backend = %result.backend,
                    max_rel_error = result.max_rel_error,
                    deterministic = result.deterministic,
                    "evaluation case failed"
                );
            }
            results.push(result);
        }

        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();

        Ok(EvaluationReport {
            generated_at_unix_ms,
            rel_tolerance: self.rel_tolerance,
            backends: vec![session.backend_name().to_string()],
            cases: results,
        })
    }

    fn run_case(&self, session: &AccelSession, case: &EvalCase) -> Result<EvalResult> {
        // Row-major `outputs x inner` operand and a length-`inner` vector.
        let matrix = deterministic_values(case.outputs, case.inner);
        let vector = deterministic_values(1, case.inner);

        let (expected, first, second) = match case.operation {
            Operation::Matvecmul => {
                let problem = MatvecProblem::new(case.outputs, case.inner);
                (
                    reference_matvecmul(&matrix, &vector, case.outputs, case.inner)?,
                    session.execute_matvecmul(problem, &matrix, &vector)?,
                    session.execute_matvecmul(problem, &matrix, &vector)?,
                )
            }
            Operation::Matmul => {
                let problem = RowDotProblem::new(case.outputs, case.inner);
                (
                    reference_matmul(&vector, &matrix, case.outputs, case.inner)?,
                    session.execute_matmul(problem, &vector, &matrix)?,
                    session.execute_matmul(problem, &vector, &matrix)?,
                )
            }
        };

        let comparison = compare_outputs(&first.output, &expected)?;
        let latency_ms = first.latency_ms.min(second.latency_ms);
        let gflops = if latency_ms > 0.0 {
            case.flops() / (latency_ms * 1.0e6)
        } else {
            0.0
        };
        debug!(case = %case.name, backend = first.kernel, latency_ms, "case evaluated");

        Ok(EvalResult {
            case: case.name.clone(),
            backend: first.kernel.to_string(),
            operation: case.operation,
            outputs: case.outputs,
            inner: case.inner,
            latency_ms,
            gflops,
            max_abs_error: comparison.max_abs_error,
            mean_abs_error: comparison.mean_abs_error,
            max_rel_error: comparison.max_rel_error,
            within_tolerance: comparison.within(self.rel_tolerance),
            deterministic: bit_identical(&first.output, &second.output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BackendTarget, SessionOptions};
    use accelmul_kernels::backend::MatvecBackend;
    use std::sync::Arc;

    #[test]
    fn grid_covers_both_operations() {
        let suite = EvaluationSuite::accuracy_grid();
        assert_eq!(suite.cases().len(), 50);
        assert_eq!(suite.cases()[0].name, "matvecmul_1x1");
        assert_eq!(suite.cases()[49].name, "matmul_257x257");
    }

    #[test]
    fn cpu_backend_passes_the_grid() -> Result<()> {
        let session = AccelSession::new(SessionOptions::default())?;
        let report = EvaluationSuite::accuracy_grid().run(&session)?;
        assert_eq!(report.backends, vec!["cpu".to_string()]);
        assert!(report.all_passed());
        Ok(())
    }

    struct Skewed;

    impl MatvecBackend for Skewed {
        fn name(&self) -> &'static str {
            "skewed"
        }

        fn matvecmul(&self, matrix: &[f32], vector: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>> {
            let mut out = reference_matvecmul(matrix, vector, rows, cols)?;
            out.iter_mut().for_each(|value| *value *= 1.01);
            Ok(out)
        }

        fn matmul(&self, a: &[f32], b: &[f32], result_len: usize, a_len: usize) -> Result<Vec<f32>> {
            reference_matmul(a, b, result_len, a_len)
        }
    }

    #[test]
    fn inaccurate_backend_is_reported() -> Result<()> {
        let session = AccelSession::from_backend(BackendTarget::Gpu, Arc::new(Skewed));
        let suite = EvaluationSuite::new(vec![
            EvalCase::new(Operation::Matvecmul, 7, 7),
            EvalCase::new(Operation::Matmul, 7, 7),
        ]);
        let report = suite.run(&session)?;
        let failed: Vec<_> = report.failures().map(|r| r.case.as_str()).collect();
        assert_eq!(failed, vec!["matvecmul_7x7"]);
        Ok(())
    }

    #[test]
    fn diff_pairs_cases_by_backend_and_name() -> Result<()> {
        let session = AccelSession::new(SessionOptions::default())?;
        let suite = EvaluationSuite::new(vec![EvalCase::new(Operation::Matmul, 2, 2)]);
        let baseline = suite.run(&session)?;
        let mut current = baseline.clone();
        current.cases[0].latency_ms += 1.5;

        let blob = serde_json::to_string(&baseline)?;
        let baseline: EvaluationReport = serde_json::from_str(&blob)?;
        let deltas = current.diff(&baseline);
        let delta = &deltas["cpu/matmul_2x2"];
        assert!((delta.latency_ms_delta - 1.5).abs() < 1e-9);
        Ok(())
    }
}
