//! Binding, grid partitioning and synchronous submission of a compute pass.

use crate::buffers::DeviceBuffer;
use crate::device::DeviceContext;
use crate::error::{GpuError, GpuResult};
use crate::program::KernelPipeline;
use crate::scope::ResourceScope;
use bytemuck::{Pod, Zeroable};
use pollster::block_on;
use tracing::{debug, error};
use wgpu::util::DeviceExt;

/// Scalar constants handed to every kernel as a small uniform payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchParams {
    /// Length of the reduced dimension (`cols` / `a_len`).
    pub inner: u32,
    /// Number of output elements, which is also the grid size.
    pub outputs: u32,
    _pad: [u32; 2],
}

impl DispatchParams {
    pub fn new(inner: u32, outputs: u32) -> Self {
        Self {
            inner,
            outputs,
            _pad: [0; 2],
        }
    }
}

/// One-dimensional launch geometry.
///
/// `threadgroups * threadgroup_width >= grid`. The kernels return early
/// for indices at or past `grid`, so each output index is written by
/// exactly one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDescriptor {
    pub grid: u32,
    pub threadgroup_width: u32,
    pub threadgroups: u32,
}

impl DispatchDescriptor {
    pub fn cover(grid: u32, threadgroup_width: u32, max_threadgroups: u32) -> GpuResult<Self> {
        let threadgroup_width = threadgroup_width.max(1);
        let threadgroups = grid.div_ceil(threadgroup_width);
        if threadgroups > max_threadgroups {
            return Err(GpuError::DispatchExecutionError(format!(
                "grid of {grid} threads needs {threadgroups} threadgroups of {threadgroup_width}, \
                 device allows {max_threadgroups}"
            )));
        }
        Ok(Self {
            grid,
            threadgroup_width,
            threadgroups,
        })
    }

    pub fn scheduled_threads(&self) -> u64 {
        u64::from(self.threadgroups) * u64::from(self.threadgroup_width)
    }
}

/// Binds `buffers` to slots `0..n` and `params` to slot `n`, runs one
/// compute pass and blocks until the device reports completion.
pub fn dispatch(
    ctx: &DeviceContext,
    scope: &mut ResourceScope,
    pipeline: &KernelPipeline,
    buffers: &[&DeviceBuffer],
    params: &DispatchParams,
    descriptor: &DispatchDescriptor,
) -> GpuResult<()> {
    if buffers.len() != pipeline.slot_count() {
        return Err(GpuError::DispatchExecutionError(format!(
            "kernel `{}` declares {} buffer slots but {} buffers were bound",
            pipeline.program(),
            pipeline.slot_count(),
            buffers.len()
        )));
    }

    let device = ctx.device();
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let params_buffer = scope.adopt(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("params"),
        contents: bytemuck::bytes_of(params),
        usage: wgpu::BufferUsages::UNIFORM,
    }));

    let mut entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(slot, buffer)| wgpu::BindGroupEntry {
            binding: slot as u32,
            resource: buffer.raw().as_entire_binding(),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: buffers.len() as u32,
        resource: params_buffer.as_entire_binding(),
    });

    let bind_group = scope.adopt(device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(pipeline.program()),
        layout: pipeline.bind_group_layout(),
        entries: &entries,
    }));

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("dispatch_encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(pipeline.program()),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline.raw());
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(descriptor.threadgroups, 1, 1);
    }

    debug!(
        program = pipeline.program(),
        grid = descriptor.grid,
        threadgroup_width = descriptor.threadgroup_width,
        threadgroups = descriptor.threadgroups,
        "submitting compute pass"
    );
    ctx.queue().submit(Some(encoder.finish()));
    device.poll(wgpu::Maintain::Wait);

    let validation = block_on(device.pop_error_scope());
    let out_of_memory = block_on(device.pop_error_scope());
    if let Some(err) = validation.or(out_of_memory) {
        error!(program = pipeline.program(), "compute pass failed: {err}");
        return Err(GpuError::DispatchExecutionError(err.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays the launch on the host and counts writes per output index.
    fn coverage(descriptor: &DispatchDescriptor) -> Vec<u32> {
        let mut hits = vec![0u32; descriptor.grid as usize];
        for group in 0..descriptor.threadgroups {
            for lane in 0..descriptor.threadgroup_width {
                let index = group * descriptor.threadgroup_width + lane;
                if index < descriptor.grid {
                    hits[index as usize] += 1;
                }
            }
        }
        hits
    }

    #[test]
    fn every_output_is_covered_exactly_once() {
        for grid in [1u32, 2, 3, 7, 31, 32, 33, 64, 257, 1000] {
            for width in [1u32, 16, 32, 64] {
                let descriptor = DispatchDescriptor::cover(grid, width, 65_535).unwrap();
                assert!(descriptor.scheduled_threads() >= u64::from(grid));
                assert!(descriptor.scheduled_threads() < u64::from(grid) + u64::from(width));
                assert!(coverage(&descriptor).iter().all(|&hits| hits == 1));
            }
        }
    }

    #[test]
    fn small_grid_uses_one_threadgroup() {
        let descriptor = DispatchDescriptor::cover(3, 32, 65_535).unwrap();
        assert_eq!(descriptor.threadgroups, 1);
        assert_eq!(descriptor.threadgroup_width, 32);
    }

    #[test]
    fn zero_width_is_treated_as_one() {
        let descriptor = DispatchDescriptor::cover(5, 0, 65_535).unwrap();
        assert_eq!(descriptor.threadgroup_width, 1);
        assert_eq!(descriptor.threadgroups, 5);
    }

    #[test]
    fn oversized_grid_is_rejected() {
        let err = DispatchDescriptor::cover(1 << 24, 32, 65_535).unwrap_err();
        assert!(matches!(err, GpuError::DispatchExecutionError(_)));
    }

    #[test]
    fn params_are_sixteen_bytes() {
        let params = DispatchParams::new(2, 3);
        assert_eq!(bytemuck::bytes_of(&params).len(), 16);
        assert_eq!(bytemuck::cast::<_, [u32; 4]>(params), [2, 3, 0, 0]);
    }
}
