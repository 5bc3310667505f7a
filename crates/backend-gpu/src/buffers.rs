//! Device buffer allocation and host/device transfers.

use crate::device::DeviceContext;
use crate::error::{GpuError, GpuResult};
use crate::scope::ResourceScope;
use bytemuck::cast_slice;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::trace;

/// Byte extent of `elements` f32 values, saturating at `u64::MAX`.
///
/// No host slice reaches the saturated value, so an oversized shape can
/// never compare equal to a real operand.
pub fn f32_byte_len(elements: usize) -> u64 {
    u64::try_from(elements)
        .map_or(u64::MAX, |n| n.saturating_mul(std::mem::size_of::<f32>() as u64))
}

/// Storage buffer sized exactly to one operand or the result.
pub struct DeviceBuffer {
    label: &'static str,
    buffer: Arc<wgpu::Buffer>,
    byte_size: u64,
}

impl DeviceBuffer {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

pub struct BufferManager<'ctx> {
    ctx: &'ctx DeviceContext,
}

impl<'ctx> BufferManager<'ctx> {
    pub fn new(ctx: &'ctx DeviceContext) -> Self {
        Self { ctx }
    }

    /// Zero-initialised storage buffer of `byte_size` bytes, owned by `scope`.
    pub fn allocate(
        &self,
        scope: &mut ResourceScope,
        label: &'static str,
        byte_size: u64,
    ) -> DeviceBuffer {
        let buffer = scope.adopt(self.ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: byte_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        }));
        trace!(label, byte_size, "device buffer allocated");
        DeviceBuffer {
            label,
            buffer,
            byte_size,
        }
    }

    /// Copies `data` into `buffer`. The byte length must equal the buffer size.
    pub fn upload(&self, buffer: &DeviceBuffer, data: &[f32]) -> GpuResult<()> {
        let bytes: &[u8] = cast_slice(data);
        if bytes.len() as u64 != buffer.byte_size {
            return Err(GpuError::size_mismatch(
                buffer.label,
                buffer.byte_size,
                bytes.len() as u64,
            ));
        }
        self.ctx.queue().write_buffer(buffer.raw(), 0, bytes);
        trace!(label = buffer.label, bytes = bytes.len(), "uploaded to device");
        Ok(())
    }

    /// Copies the whole of `buffer` back into `out` through a staging buffer
    /// owned by `scope`. Blocks until the copy has landed.
    pub fn download(
        &self,
        scope: &mut ResourceScope,
        buffer: &DeviceBuffer,
        out: &mut [f32],
    ) -> GpuResult<()> {
        let out_bytes = f32_byte_len(out.len());
        if out_bytes != buffer.byte_size {
            return Err(GpuError::size_mismatch(
                buffer.label,
                buffer.byte_size,
                out_bytes,
            ));
        }

        let device = self.ctx.device();
        let staging = scope.adopt(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: buffer.byte_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("download_encoder"),
        });
        encoder.copy_buffer_to_buffer(buffer.raw(), 0, &staging, 0, buffer.byte_size);
        self.ctx.queue().submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| {
                GpuError::DispatchExecutionError("staging map callback never fired".into())
            })?
            .map_err(|err| {
                GpuError::DispatchExecutionError(format!("failed to map result buffer: {err}"))
            })?;

        {
            let data = slice.get_mapped_range();
            out.copy_from_slice(cast_slice(&data));
        }
        staging.unmap();
        trace!(label = buffer.label, bytes = out_bytes, "downloaded from device");
        Ok(())
    }
}
