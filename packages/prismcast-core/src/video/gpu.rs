//! GPU session for the video mixer.
//!
//! One wgpu device owns the whole session: an offscreen RGBA render target
//! for composition, a compute pass that packs the target into I420 bytes,
//! and the staging buffers for readback. Everything here dies together when
//! the session is dropped, which is also how per-source texture bindings are
//! invalidated on teardown.

use futures::executor::block_on;
use wgpu::util::DeviceExt;

use crate::error::GpuError;

/// Composition: textured quads over an opaque black clear.
const COMPOSITE_SHADER: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) pos: vec2<f32>, @location(1) uv: vec2<f32>) -> VsOut {
    var out: VsOut;
    out.pos = vec4<f32>(pos, 0.0, 1.0);
    out.uv = uv;
    return out;
}

@group(0) @binding(0) var source_tex: texture_2d<f32>;
@group(0) @binding(1) var source_samp: sampler;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    return textureSample(source_tex, source_samp, in.uv);
}
"#;

/// RGB to I420 using BT.601 coefficients: a 2x2 block of Y samples at the
/// pixel centers plus one U and one V from the block average. Each
/// invocation gathers one little-endian u32 word of the packed output, so
/// the pass is race-free and a pure function of the input image.
const YUV_SHADER: &str = r#"
struct Dims {
    width: u32,
    height: u32,
    pad0: u32,
    pad1: u32,
};

@group(0) @binding(0) var frame: texture_2d<f32>;
@group(0) @binding(1) var<storage, read_write> packed: array<u32>;
@group(0) @binding(2) var<uniform> dims: Dims;

fn luma(x: u32, y: u32) -> u32 {
    let s = textureLoad(frame, vec2<u32>(x, y), 0);
    let v = 16.0 + 65.481 * s.r + 128.553 * s.g + 24.966 * s.b;
    return u32(clamp(v, 0.0, 255.0));
}

fn block_mean(bx: u32, by: u32) -> vec3<f32> {
    let x = bx * 2u;
    let y = by * 2u;
    let s = textureLoad(frame, vec2<u32>(x, y), 0)
        + textureLoad(frame, vec2<u32>(x + 1u, y), 0)
        + textureLoad(frame, vec2<u32>(x, y + 1u), 0)
        + textureLoad(frame, vec2<u32>(x + 1u, y + 1u), 0);
    return s.rgb * 0.25;
}

fn plane_byte(idx: u32) -> u32 {
    let w = dims.width;
    let len_y = w * dims.height;
    let len_uv = len_y / 4u;
    if (idx < len_y) {
        return luma(idx % w, idx / w);
    } else if (idx < len_y + len_uv) {
        let i = idx - len_y;
        let m = block_mean(i % (w / 2u), i / (w / 2u));
        let v = 128.0 - 37.797 * m.r - 74.203 * m.g + 112.0 * m.b;
        return u32(clamp(v, 0.0, 255.0));
    }
    let i = idx - len_y - len_uv;
    let m = block_mean(i % (w / 2u), i / (w / 2u));
    let v = 128.0 + 112.0 * m.r - 93.786 * m.g - 18.214 * m.b;
    return u32(clamp(v, 0.0, 255.0));
}

@compute @workgroup_size(256)
fn pack_i420(@builtin(global_invocation_id) gid: vec3<u32>) {
    let total = dims.width * dims.height * 3u / 2u;
    let base = gid.x * 4u;
    if (base >= total) {
        return;
    }
    var word: u32 = 0u;
    for (var i = 0u; i < 4u; i = i + 1u) {
        let idx = base + i;
        if (idx < total) {
            word = word | ((plane_byte(idx) & 0xffu) << (8u * i));
        }
    }
    packed[gid.x] = word;
}
"#;

/// Bytes per interleaved position/texcoord quad (4 vertices of 4 f32).
pub(crate) const QUAD_BYTES: u64 = 64;

const YUV_WORKGROUP: u32 = 256;

/// A source's mixer-owned texture binding. Storage is allocated lazily at
/// the first upload, since dimensions arrive with the frame data.
pub(crate) struct SourceBinding {
    pub texture: Option<BoundTexture>,
}

pub(crate) struct BoundTexture {
    pub width: u32,
    pub height: u32,
    pub texture: wgpu::Texture,
    pub bind_group: wgpu::BindGroup,
}

/// All GPU resources of one video mixer session.
pub(crate) struct GpuSession {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub target: wgpu::Texture,
    pub target_view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub source_layout: wgpu::BindGroupLayout,
    pub composite: wgpu::RenderPipeline,
    pub yuv: wgpu::ComputePipeline,
    pub yuv_bind: wgpu::BindGroup,
    pub out_buffer: wgpu::Buffer,
    pub staging: wgpu::Buffer,
    pub preview_staging: wgpu::Buffer,
    pub vertex: wgpu::Buffer,
    vertex_quads: u64,
    pub width: u32,
    pub height: u32,
    /// Tight I420 byte count: `width * height * 3 / 2`.
    pub out_size: usize,
    /// `out_size` padded up to the 4-byte copy granule.
    pub padded_out: u64,
    pub preview_bytes_per_row: u32,
}

impl GpuSession {
    /// Builds the full session. On failure everything acquired so far is
    /// released in reverse order as the partial state drops.
    pub(crate) fn new(width: u32, height: u32) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or(GpuError::NoAdapter)?;

        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("prismcast-video"),
                ..Default::default()
            },
            None,
        ))
        .map_err(|err| GpuError::Device(err.to_string()))?;

        // Surface everything else through the error scope instead of the
        // default uncaptured-error panic.
        device.on_uncaptured_error(Box::new(|err| {
            log::error!("[Video] Uncaptured GPU error: {err}");
        }));
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("composite-target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("source-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let source_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("source-texture"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let composite_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("composite"),
            source: wgpu::ShaderSource::Wgsl(COMPOSITE_SHADER.into()),
        });
        let composite_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("composite"),
            bind_group_layouts: &[&source_layout],
            push_constant_ranges: &[],
        });
        let composite = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("composite"),
            layout: Some(&composite_layout),
            vertex: wgpu::VertexState {
                module: &composite_module,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: 16,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                }],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &composite_module,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        let out_size = (width as usize) * (height as usize) * 3 / 2;
        let padded_out = (out_size as u64).next_multiple_of(4);
        let out_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("i420-pack"),
            size: padded_out,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("i420-staging"),
            size: padded_out,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let dims = [width, height, 0u32, 0u32];
        let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dims"),
            contents: bytemuck::cast_slice(&dims),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let yuv_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("i420-pack"),
            source: wgpu::ShaderSource::Wgsl(YUV_SHADER.into()),
        });
        let yuv_bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("i420-pack"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let yuv_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("i420-pack"),
            bind_group_layouts: &[&yuv_bind_layout],
            push_constant_ranges: &[],
        });
        let yuv = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("i420-pack"),
            layout: Some(&yuv_layout),
            module: &yuv_module,
            entry_point: Some("pack_i420"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        let yuv_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("i420-pack"),
            layout: &yuv_bind_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&target_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: out_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniform.as_entire_binding(),
                },
            ],
        });

        let preview_bytes_per_row = (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let preview_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("preview-staging"),
            size: preview_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let vertex_quads = 16;
        let vertex = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("source-quads"),
            size: vertex_quads * QUAD_BYTES,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        if let Some(err) = block_on(device.pop_error_scope()) {
            return Err(GpuError::Validation(format!("session setup: {err}")));
        }

        Ok(Self {
            device,
            queue,
            target,
            target_view,
            sampler,
            source_layout,
            composite,
            yuv,
            yuv_bind,
            out_buffer,
            staging,
            preview_staging,
            vertex,
            vertex_quads,
            width,
            height,
            out_size,
            padded_out,
            preview_bytes_per_row,
        })
    }

    /// Number of compute workgroups covering the packed output.
    pub(crate) fn yuv_workgroups(&self) -> u32 {
        ((self.padded_out / 4) as u32).div_ceil(YUV_WORKGROUP)
    }

    /// Grows the shared quad buffer when more sources are drawn than ever
    /// before in this session.
    pub(crate) fn ensure_vertex_capacity(&mut self, quads: usize) {
        let quads = quads as u64;
        if quads <= self.vertex_quads {
            return;
        }
        self.vertex_quads = quads.next_power_of_two();
        self.vertex = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("source-quads"),
            size: self.vertex_quads * QUAD_BYTES,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
    }

    /// Allocates a source texture and its composite bind group.
    pub(crate) fn create_source_texture(&self, width: u32, height: u32) -> BoundTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("source-frame"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Bgra8Unorm,
            usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("source-frame"),
            layout: &self.source_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        BoundTexture {
            width,
            height,
            texture,
            bind_group,
        }
    }

    /// Synchronously reads back the first `len` bytes of a mappable buffer.
    pub(crate) fn read_buffer(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<u8>, GpuError> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(GpuError::Readback(err.to_string())),
            Err(_) => return Err(GpuError::Readback("map callback never fired".into())),
        }
        let data = {
            let view = slice.get_mapped_range();
            view[..len].to_vec()
        };
        buffer.unmap();
        Ok(data)
    }

    /// Opens a validation error scope around a tick's GPU work.
    pub(crate) fn begin_errors(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    /// Closes the error scope, surfacing any validation failure.
    pub(crate) fn check_errors(&self, what: &str) -> Result<(), GpuError> {
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Validation(format!("{what}: {err}")));
        }
        Ok(())
    }
}
