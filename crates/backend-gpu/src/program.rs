//! Embedded kernel programs and their compilation into pipelines.
//!
//! Compilation runs in two stages. The front end parses and validates the
//! WGSL with naga and checks the entry point and binding slots, without
//! touching a device. The back end creates the shader module and compute
//! pipeline on the device inside error scopes.

use crate::device::DeviceContext;
use crate::dispatch::DispatchParams;
use crate::error::{GpuError, GpuResult};
use crate::scope::ResourceScope;
use pollster::block_on;
use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::Arc;
use tracing::{debug, error};

/// Token in a program template replaced by the threadgroup width.
pub const WORKGROUP_WIDTH_TOKEN: &str = "WORKGROUP_WIDTH";

/// How a kernel accesses one storage-buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAccess {
    Read,
    ReadWrite,
}

const MATVECMUL_WGSL: &str = r#"
struct Params {
  inner: u32,
  outputs: u32,
  _pad0: u32,
  _pad1: u32,
}

@group(0) @binding(0)
var<storage, read> row_major_matrix: array<f32>;

@group(0) @binding(1)
var<storage, read> input_vector: array<f32>;

@group(0) @binding(2)
var<storage, read_write> output_vector: array<f32>;

@group(0) @binding(3)
var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_WIDTH, 1, 1)
fn matvecmul(@builtin(global_invocation_id) gid: vec3<u32>) {
  let row = gid.x;
  if (row >= params.outputs) {
    return;
  }

  let base = row * params.inner;
  var sum: f32 = 0.0;
  for (var col: u32 = 0u; col < params.inner; col = col + 1u) {
    sum = sum + row_major_matrix[base + col] * input_vector[col];
  }

  output_vector[row] = sum;
}
"#;

const MATMUL_WGSL: &str = r#"
struct Params {
  inner: u32,
  outputs: u32,
  _pad0: u32,
  _pad1: u32,
}

@group(0) @binding(0)
var<storage, read_write> result_vector: array<f32>;

@group(0) @binding(1)
var<storage, read> a_vector: array<f32>;

@group(0) @binding(2)
var<storage, read> b_matrix: array<f32>;

@group(0) @binding(3)
var<uniform> params: Params;

@compute @workgroup_size(WORKGROUP_WIDTH, 1, 1)
fn matmul(@builtin(global_invocation_id) gid: vec3<u32>) {
  let i = gid.x;
  if (i >= params.outputs) {
    return;
  }

  let base = i * params.inner;
  var sum: f32 = 0.0;
  for (var k: u32 = 0u; k < params.inner; k = k + 1u) {
    sum = sum + a_vector[k] * b_matrix[base + k];
  }

  result_vector[i] = sum;
}
"#;

/// WGSL source for one kernel plus the slot layout it declares.
///
/// Storage buffers occupy bindings `0..slots.len()` in order; the
/// [`DispatchParams`] uniform sits at binding `slots.len()`.
#[derive(Debug, Clone)]
pub struct KernelProgram {
    name: &'static str,
    entry_point: &'static str,
    template: Cow<'static, str>,
    slots: &'static [SlotAccess],
}

impl KernelProgram {
    pub fn new(
        name: &'static str,
        entry_point: &'static str,
        template: impl Into<Cow<'static, str>>,
        slots: &'static [SlotAccess],
    ) -> Self {
        Self {
            name,
            entry_point,
            template: template.into(),
            slots,
        }
    }

    /// Slots: matrix, vector, output.
    pub fn matvecmul() -> Self {
        Self::new(
            "matvecmul",
            "matvecmul",
            MATVECMUL_WGSL,
            &[SlotAccess::Read, SlotAccess::Read, SlotAccess::ReadWrite],
        )
    }

    /// Slots: result, a, b.
    pub fn matmul() -> Self {
        Self::new(
            "matmul",
            "matmul",
            MATMUL_WGSL,
            &[SlotAccess::ReadWrite, SlotAccess::Read, SlotAccess::Read],
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn entry_point(&self) -> &'static str {
        self.entry_point
    }

    pub fn slots(&self) -> &'static [SlotAccess] {
        self.slots
    }

    pub fn render(&self, execution_width: u32) -> String {
        self.template
            .replace(WORKGROUP_WIDTH_TOKEN, &execution_width.max(1).to_string())
    }

    /// Front end: parse, validate and resolve the entry point and slots.
    pub fn check(&self, execution_width: u32) -> GpuResult<CheckedProgram> {
        let source = self.render(execution_width);

        let module = naga::front::wgsl::parse_str(&source).map_err(|err| {
            self.compile_error(err.emit_to_string(&source))
        })?;

        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .map_err(|err| self.compile_error(err.emit_to_string(&source)))?;

        let has_entry_point = module
            .entry_points
            .iter()
            .any(|ep| ep.name == self.entry_point && ep.stage == naga::ShaderStage::Compute);
        if !has_entry_point {
            error!(program = self.name, entry_point = self.entry_point, "entry point not found");
            return Err(GpuError::KernelSymbolNotFound {
                program: self.name.to_string(),
                entry_point: self.entry_point.to_string(),
            });
        }

        self.check_slots(&module)?;

        debug!(program = self.name, execution_width, "kernel front end passed");
        Ok(CheckedProgram {
            name: self.name,
            entry_point: self.entry_point,
            source,
            slots: self.slots,
            execution_width: execution_width.max(1),
        })
    }

    /// Front end followed by pipeline creation on `ctx`. Everything created
    /// on the device is adopted by `scope`, including on failure.
    pub fn compile(
        &self,
        ctx: &DeviceContext,
        scope: &mut ResourceScope,
    ) -> GpuResult<KernelPipeline> {
        self.check(ctx.info().preferred_execution_width)?
            .build(ctx, scope)
    }

    fn check_slots(&self, module: &naga::Module) -> GpuResult<()> {
        let binding_of = |index: usize| {
            module.global_variables.iter().find_map(|(_, var)| {
                var.binding
                    .as_ref()
                    .filter(|b| b.group == 0 && b.binding as usize == index)
                    .map(|_| var.space)
            })
        };

        for (index, access) in self.slots.iter().enumerate() {
            match (binding_of(index), access) {
                (Some(naga::AddressSpace::Storage { access: found }), SlotAccess::Read)
                    if !found.contains(naga::StorageAccess::STORE) => {}
                (Some(naga::AddressSpace::Storage { access: found }), SlotAccess::ReadWrite)
                    if found.contains(naga::StorageAccess::STORE) => {}
                (found, _) => {
                    return Err(self.compile_error(format!(
                        "binding {index} must be a {access:?} storage buffer, found {found:?}"
                    )));
                }
            }
        }

        match binding_of(self.slots.len()) {
            Some(naga::AddressSpace::Uniform) => Ok(()),
            found => Err(self.compile_error(format!(
                "binding {} must be the params uniform, found {found:?}",
                self.slots.len()
            ))),
        }
    }

    fn compile_error(&self, diagnostic: String) -> GpuError {
        error!(program = self.name, "kernel compilation failed:\n{diagnostic}");
        GpuError::KernelCompileError {
            program: self.name.to_string(),
            diagnostic,
        }
    }
}

/// A program that passed the front end and is ready for a device.
#[derive(Debug, Clone)]
pub struct CheckedProgram {
    name: &'static str,
    entry_point: &'static str,
    source: String,
    slots: &'static [SlotAccess],
    execution_width: u32,
}

impl CheckedProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn build(self, ctx: &DeviceContext, scope: &mut ResourceScope) -> GpuResult<KernelPipeline> {
        let device = ctx.device();
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader_module = scope.adopt(device.create_shader_module(
            wgpu::ShaderModuleDescriptor {
                label: Some(self.name),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(self.source)),
            },
        ));

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, access)| wgpu::BindGroupLayoutEntry {
                binding: index as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: *access == SlotAccess::Read,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: self.slots.len() as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(std::mem::size_of::<DispatchParams>() as u64),
            },
            count: None,
        });

        let bind_group_layout = scope.adopt(device.create_bind_group_layout(
            &wgpu::BindGroupLayoutDescriptor {
                label: Some(self.name),
                entries: &entries,
            },
        ));
        let pipeline_layout = scope.adopt(device.create_pipeline_layout(
            &wgpu::PipelineLayoutDescriptor {
                label: Some(self.name),
                bind_group_layouts: &[&*bind_group_layout],
                push_constant_ranges: &[],
            },
        ));
        let pipeline = scope.adopt(device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some(self.name),
                layout: Some(&*pipeline_layout),
                module: &*shader_module,
                entry_point: self.entry_point,
            },
        ));

        let validation = block_on(device.pop_error_scope());
        let out_of_memory = block_on(device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            let diagnostic = err.to_string();
            error!(program = self.name, "pipeline creation failed: {diagnostic}");
            return Err(GpuError::PipelineCreationError {
                program: self.name.to_string(),
                diagnostic,
            });
        }

        debug!(
            program = self.name,
            execution_width = self.execution_width,
            "compute pipeline created"
        );
        Ok(KernelPipeline {
            program: self.name,
            pipeline,
            bind_group_layout,
            slot_count: self.slots.len(),
            execution_width: self.execution_width,
        })
    }
}

/// A compiled, device-executable kernel. Owned by the scope it was
/// compiled in.
pub struct KernelPipeline {
    program: &'static str,
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    slot_count: usize,
    execution_width: u32,
}

impl KernelPipeline {
    pub fn program(&self) -> &'static str {
        self.program
    }

    /// Threadgroup width the kernel was compiled for.
    pub fn execution_width(&self) -> u32 {
        self.execution_width
    }

    /// Number of storage-buffer slots, excluding the params uniform.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub(crate) fn raw(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    pub(crate) fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }
}
