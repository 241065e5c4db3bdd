//! GPU path for the max log-density reduction.
//!
//! One workgroup per particle, one invocation per sub-state-element. The
//! shader runs the same barrier rounds as [`crate::kernel`]: in round `r`
//! only invocation `r` adds into the workgroup accumulator, and
//! `workgroupBarrier()` closes every round. Contributions travel as `f32`.

use std::borrow::Cow;
use std::sync::{mpsc, OnceLock};

use log::warn;
use thiserror::Error;
use wgpu::util::DeviceExt;

/// Invocations per workgroup; also the largest supported `n_elements`.
pub const LANES: u32 = 64;

const MAX_WORKGROUPS: usize = 65_535;

const SHADER: &str = r#"
struct Params {
    n_active: u32,
    n_elements: u32,
    _pad0: u32,
    _pad1: u32,
};

@group(0) @binding(0) var<storage, read> contributions: array<f32>;
@group(0) @binding(1) var<storage, read_write> totals: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

var<workgroup> acc: f32;

@compute @workgroup_size(64)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let p = wg.x;
    let j = lid.x;
    var local: f32 = 0.0;
    if (p < params.n_active && j < params.n_elements) {
        local = contributions[p * params.n_elements + j];
    }
    if (j == 0u) {
        acc = 0.0;
    }
    workgroupBarrier();
    for (var r: u32 = 0u; r < params.n_elements; r = r + 1u) {
        if (j == r) {
            acc = acc + local;
        }
        workgroupBarrier();
    }
    if (j == 0u && p < params.n_active) {
        totals[p] = acc;
    }
}
"#;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("{0} sub-state elements exceed the workgroup size of {LANES}")]
    TooManyElements(usize),
    #[error("{0} particles exceed the dispatch limit")]
    TooManyParticles(usize),
    #[error("contribution buffer holds {got} values, expected {expected}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("buffer mapping failed: {0}")]
    Map(String),
}

/// Whether a row-major `n_active × n_elements` matrix of `len` values fits
/// one dispatch.
pub fn check_shape(len: usize, n_active: usize, n_elements: usize) -> Result<(), GpuError> {
    if n_elements > LANES as usize {
        return Err(GpuError::TooManyElements(n_elements));
    }
    if n_active > MAX_WORKGROUPS {
        return Err(GpuError::TooManyParticles(n_active));
    }
    let expected = n_active * n_elements;
    if len != expected {
        return Err(GpuError::ShapeMismatch { expected, got: len });
    }
    Ok(())
}

static SHARED: OnceLock<Option<GpuReducer>> = OnceLock::new();

/// Process-wide reducer, created on first use. `None` when no device is
/// available.
pub fn shared() -> Option<&'static GpuReducer> {
    SHARED
        .get_or_init(|| {
            let gpu = GpuReducer::new_blocking();
            if gpu.is_none() {
                warn!("no GPU adapter found; GPU reductions run on the CPU");
            }
            gpu
        })
        .as_ref()
}

/// GPU compute engine for the per-particle reduction.
pub struct GpuReducer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
}

impl GpuReducer {
    /// `None` when no adapter or device is available.
    pub async fn new() -> Option<Self> {
        let instance = wgpu::Instance::default();
        let adapter: wgpu::Adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default(), None)
            .await
            .ok()?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("MaxLogDensity Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SHADER)),
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("MaxLogDensity Pipeline"),
            layout: None,
            module: &shader,
            entry_point: "main",
        });

        Some(GpuReducer {
            device,
            queue,
            pipeline,
        })
    }

    /// Blocking constructor.
    pub fn new_blocking() -> Option<Self> {
        pollster::block_on(Self::new())
    }

    /// Per-particle totals of a row-major `n_active × n_elements` matrix.
    pub fn reduce(
        &self,
        contributions: &[f64],
        n_active: usize,
        n_elements: usize,
    ) -> Result<Vec<f64>, GpuError> {
        check_shape(contributions.len(), n_active, n_elements)?;
        if n_active == 0 {
            return Ok(Vec::new());
        }

        // zero-sized storage bindings are invalid
        let mut input: Vec<f32> = contributions.iter().map(|&x| x as f32).collect();
        if input.is_empty() {
            input.push(0.0);
        }
        let params: [u32; 4] = [n_active as u32, n_elements as u32, 0, 0];
        let out_size = (n_active * std::mem::size_of::<f32>()) as wgpu::BufferAddress;

        let input_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("contributions"),
                contents: bytemuck::cast_slice(&input),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let totals_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("totals"),
            size: out_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let params_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: out_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let layout = self.pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("MaxLogDensity Bindings"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: totals_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("MaxLogDensity Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(n_active as u32, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&totals_buf, 0, &staging, 0, out_size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GpuError::Map(e.to_string())),
            Err(e) => return Err(GpuError::Map(e.to_string())),
        }

        let totals = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&data)
                .iter()
                .map(|&x| x as f64)
                .collect()
        };
        staging.unmap();
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_checks() {
        assert!(check_shape(12, 4, 3).is_ok());
        assert!(check_shape(0, 0, 3).is_ok());
        assert!(matches!(check_shape(65, 1, 65), Err(GpuError::TooManyElements(65))));
        assert!(matches!(
            check_shape(65_536, 65_536, 1),
            Err(GpuError::TooManyParticles(65_536))
        ));
        assert!(matches!(
            check_shape(11, 4, 3),
            Err(GpuError::ShapeMismatch { expected: 12, got: 11 })
        ));
    }

    #[test]
    fn test_matches_cpu_kernel() {
        // needs a device
        let Some(gpu) = shared() else {
            return;
        };
        let contributions: Vec<f64> = (0..12).map(|i| -(i as f64) * 0.25).collect();
        let totals = gpu.reduce(&contributions, 4, 3).unwrap();
        let mut cpu = vec![0.0; 4];
        crate::kernel::MaxLogDensityKernel::new(4, 3, crate::kernel::ReductionMode::Serial)
            .reduce_matrix(&contributions, &mut cpu);
        for (g, c) in totals.iter().zip(&cpu) {
            assert!((g - c).abs() < 1e-4);
        }
    }
}
