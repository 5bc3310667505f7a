//! Resolution of the default compute accelerator.

use crate::error::{GpuError, GpuResult};
use crate::scope::{ResourceKind, ScopedResource};
use pollster::block_on;
use serde::Serialize;
use tracing::{error, info};

/// Adapter selection knobs.
#[derive(Debug, Clone)]
pub struct GpuOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    pub backends: wgpu::Backends,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            backends: wgpu::Backends::all(),
        }
    }
}

/// Information about the GPU device.
#[derive(Debug, Clone, Serialize)]
pub struct GpuDeviceInfo {
    pub name: String,
    pub vendor: String,
    pub backend: String,
    pub device_type: String,
    /// SIMD width the kernels are compiled for and dispatched with.
    pub preferred_execution_width: u32,
    pub max_threadgroups_per_dimension: u32,
    pub max_storage_binding_bytes: u64,
}

/// A resolved device and its submission queue.
///
/// The per-call entry points resolve a fresh context on every call. Callers
/// that manage the device themselves pass one in through the `*_on`
/// variants.
pub struct DeviceContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    info: GpuDeviceInfo,
}

impl DeviceContext {
    pub fn resolve() -> GpuResult<Self> {
        Self::resolve_with(&GpuOptions::default())
    }

    pub fn resolve_with(options: &GpuOptions) -> GpuResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .ok_or_else(|| GpuError::DeviceUnavailable("no suitable GPU adapter found".into()))?;

        let adapter_info = adapter.get_info();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("accelmul device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|err| {
            GpuError::DeviceUnavailable(format!(
                "adapter '{}' refused device request: {err}",
                adapter_info.name
            ))
        })?;
        install_device_error_handlers(&device);

        let limits = device.limits();
        let info = GpuDeviceInfo {
            name: adapter_info.name.clone(),
            vendor: canonical_vendor_name(&adapter_info),
            backend: format!("{:?}", adapter_info.backend),
            device_type: format!("{:?}", adapter_info.device_type),
            preferred_execution_width: preferred_execution_width(&adapter_info, &limits),
            max_threadgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_storage_binding_bytes: u64::from(limits.max_storage_buffer_binding_size)
                .min(limits.max_buffer_size),
        };
        info!(
            adapter = %info.name,
            vendor = %info.vendor,
            backend = %info.backend,
            execution_width = info.preferred_execution_width,
            "compute device resolved"
        );

        Ok(Self {
            device,
            queue,
            limits,
            info,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    pub fn info(&self) -> &GpuDeviceInfo {
        &self.info
    }
}

impl ScopedResource for DeviceContext {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Device
    }
}

fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|err| {
        error!("uncaptured GPU error: {err}");
    }));
    device.set_device_lost_callback(|reason, message| {
        error!("GPU device lost: reason={reason:?}, message={message}");
    });
}

/// wgpu does not expose the hardware SIMD width, so it is derived from the
/// vendor and clamped to what a single threadgroup may hold.
pub(crate) fn preferred_execution_width(info: &wgpu::AdapterInfo, limits: &wgpu::Limits) -> u32 {
    let native = match info.vendor {
        0x1002 | 0x1022 => 64,
        0x8086 => 16,
        _ => 32,
    };
    let allowed = limits
        .max_compute_workgroup_size_x
        .min(limits.max_compute_invocations_per_workgroup)
        .max(1);
    native.min(allowed)
}

fn canonical_vendor_name(info: &wgpu::AdapterInfo) -> String {
    match info.vendor {
        0x10DE => "NVIDIA".to_string(),
        0x1002 | 0x1022 => "AMD".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0 => info
            .name
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string(),
        other => format!("0x{other:04x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_info(vendor: u32, name: &str) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: name.to_string(),
            vendor,
            device: 0,
            device_type: wgpu::DeviceType::DiscreteGpu,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn execution_width_follows_vendor() {
        let limits = wgpu::Limits::default();
        assert_eq!(preferred_execution_width(&adapter_info(0x10DE, "GeForce"), &limits), 32);
        assert_eq!(preferred_execution_width(&adapter_info(0x1002, "Radeon"), &limits), 64);
        assert_eq!(preferred_execution_width(&adapter_info(0x8086, "Arc"), &limits), 16);
        assert_eq!(preferred_execution_width(&adapter_info(0, "Apple M2"), &limits), 32);
    }

    #[test]
    fn execution_width_respects_threadgroup_limits() {
        let limits = wgpu::Limits {
            max_compute_workgroup_size_x: 8,
            ..wgpu::Limits::default()
        };
        assert_eq!(preferred_execution_width(&adapter_info(0x1002, "Radeon"), &limits), 8);

        let limits = wgpu::Limits {
            max_compute_invocations_per_workgroup: 0,
            ..wgpu::Limits::default()
        };
        assert_eq!(preferred_execution_width(&adapter_info(0x10DE, "GeForce"), &limits), 1);
    }

    #[test]
    fn vendor_names() {
        assert_eq!(canonical_vendor_name(&adapter_info(0x106B, "Apple M1")), "Apple");
        assert_eq!(canonical_vendor_name(&adapter_info(0, "llvmpipe (LLVM 15)")), "llvmpipe");
        assert_eq!(canonical_vendor_name(&adapter_info(0xBEEF, "Mystery")), "0xbeef");
    }
}
