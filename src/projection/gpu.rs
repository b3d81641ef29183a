//! Projection pass using wgpu shaders.
//!
//! A full-screen triangle covers the output rectangle; the fragment shader
//! samples both sources and blends them (see `shaders/projection.wgsl`).
//! Focus sharpening is a second pipeline of the same shape
//! (`shaders/sharpen.wgsl`).

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::{Device, Queue, TextureFormat};

use super::{check_sharpen, ProjectionParams, ProjectionUniforms, QuadViewRenderer, SharpenUniforms, ViewSource};
use crate::error::{LayerError, LayerResult};
use crate::graphics::{downcast_texture, GraphicsApi, WgpuTexture};

const PROJECTION_SHADER: &str = include_str!("shaders/projection.wgsl");
const SHARPEN_SHADER: &str = include_str!("shaders/sharpen.wgsl");

fn create_pipeline(
    device: &Device,
    shader: &wgpu::ShaderModule,
    layout: &wgpu::PipelineLayout,
    format: TextureFormat,
    label: &str,
) -> wgpu::RenderPipeline {
    log::debug!("[PROJECTION] Creating {} for {:?}", label, format);
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                // The shader does the blending itself.
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Sharpening pipeline state.
struct SharpenPass {
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<TextureFormat, wgpu::RenderPipeline>,
    uniform_buffer: wgpu::Buffer,
}

impl SharpenPass {
    fn new(device: &Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Sharpen Shader"),
            source: wgpu::ShaderSource::Wgsl(SHARPEN_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sharpen Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Sharpen Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sharpen Uniforms"),
            size: std::mem::size_of::<SharpenUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
            uniform_buffer,
        }
    }
}

/// GPU renderer for the projection pass.
pub struct GpuRenderer {
    device: Arc<Device>,
    queue: Arc<Queue>,
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// One pipeline per output format.
    pipelines: HashMap<TextureFormat, wgpu::RenderPipeline>,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    sharpen: SharpenPass,
}

impl GpuRenderer {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Projection Shader"),
            source: wgpu::ShaderSource::Wgsl(PROJECTION_SHADER.into()),
        });

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Projection Bind Group Layout"),
            entries: &[
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Peripheral texture
                texture_entry(1),
                // Focus texture
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Projection Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Projection Uniforms"),
            size: std::mem::size_of::<ProjectionUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Projection Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let sharpen = SharpenPass::new(&device);

        Self {
            device,
            queue,
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
            uniform_buffer,
            sampler,
            sharpen,
        }
    }

    fn pipeline(&mut self, format: TextureFormat) -> &wgpu::RenderPipeline {
        let device = &self.device;
        let shader = &self.shader;
        let layout = &self.pipeline_layout;
        self.pipelines
            .entry(format)
            .or_insert_with(|| create_pipeline(device, shader, layout, format, "Projection Pipeline"))
    }

    fn sharpen_pipeline(&mut self, format: TextureFormat) -> &wgpu::RenderPipeline {
        let device = &self.device;
        let pass = &mut self.sharpen;
        let (shader, layout) = (&pass.shader, &pass.pipeline_layout);
        pass.pipelines
            .entry(format)
            .or_insert_with(|| create_pipeline(device, shader, layout, format, "Sharpen Pipeline"))
    }

    fn draw(
        &self,
        pipeline: &wgpu::RenderPipeline,
        bind_group: &wgpu::BindGroup,
        target: &wgpu::TextureView,
        rect: super::Rect,
        label: &str,
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(
                rect.x as f32,
                rect.y as f32,
                rect.width as f32,
                rect.height as f32,
                0.0,
                1.0,
            );
            pass.set_scissor_rect(rect.x as u32, rect.y as u32, rect.width, rect.height);
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl QuadViewRenderer for GpuRenderer {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Wgpu
    }

    fn render(
        &mut self,
        peripheral: ViewSource<'_>,
        focus: ViewSource<'_>,
        output: ViewSource<'_>,
        params: &ProjectionParams,
    ) -> LayerResult<()> {
        peripheral.check()?;
        focus.check()?;
        output.check()?;
        let peripheral_texture = downcast_texture::<WgpuTexture>(peripheral.texture, GraphicsApi::Wgpu)?;
        let focus_texture = downcast_texture::<WgpuTexture>(focus.texture, GraphicsApi::Wgpu)?;
        let output_texture = downcast_texture::<WgpuTexture>(output.texture, GraphicsApi::Wgpu)?;
        if output.texture.desc().sample_count != 1 {
            return Err(LayerError::Configuration(
                "projection output must be single-sampled".to_string(),
            ));
        }

        let uniforms = ProjectionUniforms::new(&peripheral, &focus, params);
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let peripheral_view = peripheral_texture.layer_view(peripheral.layer);
        let focus_view = focus_texture.layer_view(focus.layer);
        let output_view = output_texture.layer_view(output.layer);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Projection Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&peripheral_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&focus_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let pipeline = self.pipeline(output_texture.format()).clone();
        self.draw(&pipeline, &bind_group, &output_view, output.rect, "Projection Pass");
        Ok(())
    }

    fn sharpen(&mut self, source: ViewSource<'_>, output: ViewSource<'_>, sharpness: f32) -> LayerResult<()> {
        check_sharpen(&source, &output)?;
        let source_texture = downcast_texture::<WgpuTexture>(source.texture, GraphicsApi::Wgpu)?;
        let output_texture = downcast_texture::<WgpuTexture>(output.texture, GraphicsApi::Wgpu)?;

        let uniforms = SharpenUniforms::new(&source, &output, sharpness);
        self.queue
            .write_buffer(&self.sharpen.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let source_view = source_texture.layer_view(source.layer);
        let output_view = output_texture.layer_view(output.layer);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sharpen Bind Group"),
            layout: &self.sharpen.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.sharpen.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
            ],
        });

        let pipeline = self.sharpen_pipeline(output_texture.format()).clone();
        self.draw(&pipeline, &bind_group, &output_view, output.rect, "Sharpen Pass");
        Ok(())
    }
}
