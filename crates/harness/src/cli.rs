//! CLI wiring for accelmul.

use crate::eval::{EvaluationReport, EvaluationSuite};
use crate::session::{AccelSession, BackendTarget, ExecutionResult, SessionOptions};
use accelmul_backend_cpu::planner::CpuStrategy;
use accelmul_backend_cpu::runtime::CpuExecutorOptions;
use accelmul_backend_gpu::wgpu::PowerPreference;
use accelmul_backend_gpu::{DeviceContext, GpuError, GpuOptions, GpuResult};
use accelmul_kernels::config::{MatvecProblem, RowDotProblem};
use accelmul_kernels::utils::deterministic_values;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "accelmul", about = "GPU-offloaded matrix-vector primitives")]
pub struct Cli {
    #[arg(long, value_enum, default_value = "gpu")]
    pub target: TargetArg,

    /// CPU execution strategy.
    #[arg(long, value_enum, default_value = "auto")]
    pub cpu_strategy: CpuStrategyArg,

    /// Prefer a low-power adapter over a high-performance one.
    #[arg(long, default_value_t = false)]
    pub low_power: bool,

    /// Accept wgpu's software fallback adapter.
    #[arg(long, default_value_t = false)]
    pub fallback_adapter: bool,

    /// Resolve the device once per session instead of once per call.
    #[arg(long, default_value_t = false)]
    pub reuse_device: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum TargetArg {
    Cpu,
    Gpu,
}

impl From<TargetArg> for BackendTarget {
    fn from(value: TargetArg) -> BackendTarget {
        match value {
            TargetArg::Cpu => BackendTarget::Cpu,
            TargetArg::Gpu => BackendTarget::Gpu,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum CpuStrategyArg {
    Auto,
    Gemv,
    RowParallel,
}

impl From<CpuStrategyArg> for CpuStrategy {
    fn from(value: CpuStrategyArg) -> CpuStrategy {
        match value {
            CpuStrategyArg::Auto => CpuStrategy::Auto,
            CpuStrategyArg::Gemv => CpuStrategy::Gemv,
            CpuStrategyArg::RowParallel => CpuStrategy::RowParallel,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Multiply a deterministic `rows x cols` matrix by a vector.
    Matvec {
        #[arg(long, default_value_t = 1024)]
        rows: usize,
        #[arg(long, default_value_t = 1024)]
        cols: usize,
        /// Print the full result vector as JSON.
        #[arg(long, default_value_t = false)]
        print: bool,
    },
    /// Dot a vector with each row of a deterministic `result_len x a_len` matrix.
    Matmul {
        #[arg(long, default_value_t = 1024)]
        result_len: usize,
        #[arg(long, default_value_t = 1024)]
        a_len: usize,
        #[arg(long, default_value_t = false)]
        print: bool,
    },
    /// Resolve the default compute device and print what was found.
    Devices,
    /// Run the accuracy grid on CPU and GPU and emit a JSON report.
    Suite {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
}

impl Cli {
    fn session_options(&self, target: BackendTarget) -> SessionOptions {
        SessionOptions {
            target,
            cpu: CpuExecutorOptions {
                strategy: self.cpu_strategy.into(),
                ..CpuExecutorOptions::default()
            },
            gpu: self.gpu_options(),
            reuse_device: self.reuse_device,
        }
    }

    fn gpu_options(&self) -> GpuOptions {
        GpuOptions {
            power_preference: if self.low_power {
                PowerPreference::LowPower
            } else {
                PowerPreference::HighPerformance
            },
            force_fallback_adapter: self.fallback_adapter,
            ..GpuOptions::default()
        }
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Matvec { rows, cols, print } => {
            let session = AccelSession::new(cli.session_options(cli.target.into()))?;
            let problem = MatvecProblem::new(rows, cols);
            let matrix = deterministic_values(rows, cols);
            let vector = deterministic_values(1, cols);
            let execution = session.execute_matvecmul(problem, &matrix, &vector)?;
            report_execution("matvecmul", problem.flops(), &execution, print)?;
        }
        Command::Matmul {
            result_len,
            a_len,
            print,
        } => {
            let session = AccelSession::new(cli.session_options(cli.target.into()))?;
            let problem = RowDotProblem::new(result_len, a_len);
            let a = deterministic_values(1, a_len);
            let b = deterministic_values(result_len, a_len);
            let execution = session.execute_matmul(problem, &a, &b)?;
            report_execution("matmul", problem.flops(), &execution, print)?;
        }
        Command::Devices => {
            let ctx = DeviceContext::resolve_with(&cli.gpu_options())
                .context("resolving default compute device")?;
            println!("{}", serde_json::to_string_pretty(ctx.info())?);
        }
        Command::Suite {
            ref output,
            ref baseline,
        } => {
            let suite = EvaluationSuite::accuracy_grid();
            let cpu = AccelSession::new(cli.session_options(BackendTarget::Cpu))?;
            let mut report = suite.run(&cpu)?;

            if let Some(gpu) = gpu_suite_session(&cli)? {
                report.merge(suite.run(&gpu)?);
            }

            println!(
                "backends={}, cases={}, generated_at={}",
                report.backends.join(","),
                report.cases.len(),
                report.generated_at_unix_ms
            );
            for case in &report.cases {
                println!(
                    "- {}: latency_ms={:.3} gflops={:.3} max_rel_error={:.3e} deterministic={}",
                    case.key(),
                    case.latency_ms,
                    case.gflops,
                    case.max_rel_error,
                    case.deterministic
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let baseline_blob = fs::read_to_string(path)?;
                    let baseline_report: EvaluationReport = serde_json::from_str(&baseline_blob)
                        .with_context(|| format!("parsing baseline {}", path.display()))?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "Δ {}: latency_ms={:+.3} gflops={:+.3}",
                            name, delta.latency_ms_delta, delta.gflops_delta
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                fs::write(path, json)?;
            }

            let failures: Vec<String> = report.failures().map(|case| case.key()).collect();
            if !failures.is_empty() {
                bail!("{} case(s) failed: {}", failures.len(), failures.join(", "));
            }
        }
    }
    Ok(())
}

/// GPU session for the suite, or `None` when no device can be resolved.
fn gpu_suite_session(cli: &Cli) -> Result<Option<AccelSession>> {
    if matches!(cli.target, TargetArg::Cpu) {
        return Ok(None);
    }
    if tolerate_missing_device(DeviceContext::resolve_with(&cli.gpu_options()))?.is_none() {
        return Ok(None);
    }
    AccelSession::new(cli.session_options(BackendTarget::Gpu)).map(Some)
}

/// Only a missing device is tolerated; any other failure aborts the suite.
fn tolerate_missing_device<T>(resolved: GpuResult<T>) -> Result<Option<T>> {
    match resolved {
        Ok(value) => Ok(Some(value)),
        Err(err @ GpuError::DeviceUnavailable(_)) => {
            warn!("{err}; reporting CPU results only");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn report_execution(
    operation: &str,
    flops: f64,
    execution: &ExecutionResult,
    print: bool,
) -> Result<()> {
    let gflops = if execution.latency_ms > 0.0 {
        flops / (execution.latency_ms * 1.0e6)
    } else {
        0.0
    };
    info!(
        operation,
        kernel = execution.kernel,
        outputs = execution.output.len(),
        latency_ms = execution.latency_ms,
        gflops,
        "{operation} completed"
    );
    if print {
        println!("{}", serde_json::to_string(&execution.output)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_falls_back_to_cpu_without_a_device() {
        let missing: GpuResult<u32> = Err(GpuError::DeviceUnavailable("no adapter".into()));
        assert!(tolerate_missing_device(missing).unwrap().is_none());
        assert_eq!(tolerate_missing_device(Ok(7u32)).unwrap(), Some(7));
    }

    #[test]
    fn other_device_failures_abort_the_suite() {
        let failed: GpuResult<u32> = Err(GpuError::DispatchExecutionError("lost".into()));
        let err = tolerate_missing_device(failed).unwrap_err();
        assert!(err.to_string().contains("lost"));
    }

    #[test]
    fn cpu_target_skips_device_resolution() {
        let cli = Cli::parse_from(["accelmul", "--target", "cpu", "suite"]);
        assert!(gpu_suite_session(&cli).unwrap().is_none());
    }
}
