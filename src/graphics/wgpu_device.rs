//! wgpu-backed graphics device.
//!
//! Native format codes are VkFormat values. Sharing is in-process only: a
//! handle published by one [`WgpuDevice`] opens on any other instance built on
//! the same `wgpu::Device`, which is what [`GraphicsDevice::create_composition_device`]
//! returns for this backend.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use wgpu::{Device, Queue, TextureFormat};

use super::shared::{self, SharedKind};
use super::{
    downcast_texture, AdapterLuid, GenericFormat, GraphicsApi, GraphicsDevice, GraphicsFence, GraphicsTexture,
    ShareableHandle, SharedTextureDesc, TextureDesc, TextureUsage,
};
use crate::error::{LayerError, LayerResult};
use crate::projection::gpu::GpuRenderer;
use crate::projection::QuadViewRenderer;

struct WgpuContext {
    device: Arc<Device>,
    queue: Arc<Queue>,
    luid: AdapterLuid,
    lost: Arc<AtomicBool>,
}

impl WgpuContext {
    fn key(&self) -> usize {
        Arc::as_ptr(&self.device) as usize
    }

    fn check_lost(&self) -> LayerResult<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(LayerError::DeviceLost("wgpu device lost".to_string()))
        } else {
            Ok(())
        }
    }
}

/// GPU device managing wgpu resources.
pub struct WgpuDevice {
    id: u64,
    context: Arc<WgpuContext>,
}

impl WgpuDevice {
    /// Create a device on the default high-performance adapter.
    pub fn new() -> LayerResult<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> LayerResult<Self> {
        let instance = wgpu::Instance::default();

        // Request adapter (prefer high-performance GPU)
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| LayerError::Allocation(format!("Failed to find GPU adapter: {}", e)))?;

        let info = adapter.get_info();
        log::info!("[GRAPHICS] Using GPU adapter: {:?} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("QuadViews Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| LayerError::Allocation(format!("Failed to create GPU device: {}", e)))?;

        Ok(Self::from_parts(
            Arc::new(device),
            Arc::new(queue),
            AdapterLuid(((info.vendor as u64) << 32) | info.device as u64),
        ))
    }

    /// Wrap an existing device and queue.
    pub fn from_parts(device: Arc<Device>, queue: Arc<Queue>, luid: AdapterLuid) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                log::error!("[GRAPHICS] wgpu device lost ({:?}): {}", reason, message);
                lost.store(true, Ordering::Release);
            });
        }

        Self {
            id: shared::next_device_id(),
            context: Arc::new(WgpuContext {
                device,
                queue,
                luid,
                lost,
            }),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.context.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.context.queue
    }

    /// Upload row-major texels into one layer of an 8-bit color texture.
    pub fn write_layer(&self, texture: &WgpuTexture, layer: u32, texels: &[[f32; 4]]) -> LayerResult<()> {
        texture.check_8bit()?;
        let expected = (texture.desc.width * texture.desc.height) as usize;
        if texels.len() != expected {
            return Err(LayerError::InvalidCallOrder(format!(
                "expected {} texels, got {}",
                expected,
                texels.len()
            )));
        }

        let bgra = texture.is_bgra();
        let srgb = texture.generic.is_srgb();
        let data: Vec<u8> = texels
            .iter()
            .flat_map(|texel| encode_8bit(*texel, bgra, srgb))
            .collect();

        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * texture.desc.width),
                rows_per_image: Some(texture.desc.height),
            },
            wgpu::Extent3d {
                width: texture.desc.width,
                height: texture.desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    /// Read one layer of an 8-bit color texture back to the CPU.
    pub fn read_layer(&self, texture: &WgpuTexture, layer: u32) -> LayerResult<Vec<[f32; 4]>> {
        texture.check_8bit()?;
        let width = texture.desc.width;
        let height = texture.desc.height;
        let bytes_per_row = 4 * width;
        // wgpu requires alignment to 256 bytes
        let padded_bytes_per_row = (bytes_per_row + 255) & !255;

        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Texture Read Buffer"),
            size: (padded_bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Texture Read Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let mapped = Arc::new(Mutex::new(None));
        {
            let mapped = mapped.clone();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                *mapped.lock() = Some(result);
            });
        }
        self.context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| LayerError::DeviceLost(format!("poll failed: {}", e)))?;
        match mapped.lock().take() {
            Some(Ok(())) => {},
            Some(Err(e)) => return Err(LayerError::Allocation(format!("buffer map failed: {}", e))),
            None => return Err(LayerError::Allocation("buffer map did not complete".to_string())),
        }

        let bgra = texture.is_bgra();
        let srgb = texture.generic.is_srgb();
        let data = slice.get_mapped_range();
        let mut texels = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            let start = (row * padded_bytes_per_row) as usize;
            for px in data[start..start + bytes_per_row as usize].chunks_exact(4) {
                texels.push(decode_8bit([px[0], px[1], px[2], px[3]], bgra, srgb));
            }
        }
        drop(data);
        buffer.unmap();
        Ok(texels)
    }

    fn wgpu_format(&self, native: i64) -> LayerResult<TextureFormat> {
        let format = match self.translate_to_generic(native) {
            GenericFormat::R8G8B8A8Unorm => TextureFormat::Rgba8Unorm,
            GenericFormat::R8G8B8A8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            GenericFormat::B8G8R8A8Unorm => TextureFormat::Bgra8Unorm,
            GenericFormat::B8G8R8A8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            GenericFormat::R10G10B10A2Unorm => TextureFormat::Rgb10a2Unorm,
            GenericFormat::R16G16B16A16Float => TextureFormat::Rgba16Float,
            GenericFormat::R11G11B10Float => TextureFormat::Rg11b10Ufloat,
            GenericFormat::D32Float => TextureFormat::Depth32Float,
            GenericFormat::D24UnormS8Uint => TextureFormat::Depth24PlusStencil8,
            GenericFormat::D16Unorm => TextureFormat::Depth16Unorm,
            GenericFormat::D32FloatS8X24Uint | GenericFormat::Unknown => {
                return Err(LayerError::Allocation(format!("unsupported format {}", native)));
            },
        };
        Ok(format)
    }

    fn wrap(
        &self,
        desc: &TextureDesc,
        format: TextureFormat,
        texture: Arc<wgpu::Texture>,
        handle: Option<ShareableHandle>,
    ) -> Arc<dyn GraphicsTexture> {
        Arc::new(WgpuTexture {
            desc: *desc,
            generic: self.translate_to_generic(desc.format),
            format,
            texture,
            handle,
        })
    }

    fn resolve(&self, source: &WgpuTexture, destination: &WgpuTexture) -> LayerResult<()> {
        if source.desc.width != destination.desc.width || source.desc.height != destination.desc.height {
            return Err(LayerError::Allocation("multisample resolve requires matching extents".to_string()));
        }
        if source.format != destination.format || !destination.desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            return Err(LayerError::Allocation(format!(
                "cannot resolve {:?} into {:?}",
                source.format, destination.format
            )));
        }

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Resolve Encoder"),
            });
        for layer in 0..source.desc.array_size.min(destination.desc.array_size) {
            let source_view = source.layer_view(layer);
            let destination_view = destination.layer_view(layer);
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Resolve Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &source_view,
                    resolve_target: Some(&destination_view),
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        shared::retire_owner(self.id);
    }
}

/// Payload published in the share table.
struct SharedWgpuTexture {
    device_key: usize,
    texture: Arc<wgpu::Texture>,
}

impl GraphicsDevice for WgpuDevice {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Wgpu
    }

    fn adapter_luid(&self) -> AdapterLuid {
        self.context.luid
    }

    fn create_texture(&self, desc: &TextureDesc, shareable: bool) -> LayerResult<Arc<dyn GraphicsTexture>> {
        self.context.check_lost()?;
        desc.check()?;
        let format = self.wgpu_format(desc.format)?;

        let mut usage = wgpu::TextureUsages::empty();
        if desc
            .usage
            .intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_STENCIL_ATTACHMENT)
            || desc.sample_count > 1
        {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.usage.contains(TextureUsage::SAMPLED) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.sample_count == 1 {
            usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
            if desc.usage.contains(TextureUsage::UNORDERED_ACCESS) {
                usage |= wgpu::TextureUsages::STORAGE_BINDING;
            }
        }

        let texture = Arc::new(self.context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("QuadViews Texture"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_size,
            },
            mip_level_count: desc.mip_count,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        }));

        let handle = shareable.then(|| {
            shared::publish(
                self.id,
                GraphicsApi::Wgpu,
                self.context.luid,
                SharedKind::Texture(SharedTextureDesc::new(desc, self.translate_to_generic(desc.format))),
                Arc::new(SharedWgpuTexture {
                    device_key: self.context.key(),
                    texture: texture.clone(),
                }),
            )
        });
        Ok(self.wrap(desc, format, texture, handle))
    }

    fn open_texture(&self, handle: &ShareableHandle, desc: &TextureDesc) -> LayerResult<Arc<dyn GraphicsTexture>> {
        self.context.check_lost()?;
        let format = self.wgpu_format(desc.format)?;
        let payload = shared::open_texture(
            handle,
            GraphicsApi::Wgpu,
            self.context.luid,
            &SharedTextureDesc::new(desc, self.translate_to_generic(desc.format)),
        )?
        .downcast::<SharedWgpuTexture>()
        .map_err(|_| LayerError::Import(format!("handle {} is not a wgpu texture", handle.value)))?;

        if payload.device_key != self.context.key() {
            return Err(LayerError::Import(format!(
                "handle {} belongs to another wgpu device",
                handle.value
            )));
        }
        Ok(self.wrap(desc, format, payload.texture.clone(), Some(*handle)))
    }

    fn create_fence(&self, shareable: bool) -> LayerResult<Arc<dyn GraphicsFence>> {
        self.context.check_lost()?;
        let state = Arc::new(WgpuFenceState::default());
        let handle = shareable.then(|| {
            shared::publish(
                self.id,
                GraphicsApi::Wgpu,
                self.context.luid,
                SharedKind::Fence,
                state.clone(),
            )
        });
        Ok(Arc::new(WgpuFence {
            state,
            context: self.context.clone(),
            handle,
        }))
    }

    fn open_fence(&self, handle: &ShareableHandle) -> LayerResult<Arc<dyn GraphicsFence>> {
        self.context.check_lost()?;
        let state = shared::open_fence(handle, GraphicsApi::Wgpu, self.context.luid)?
            .downcast::<WgpuFenceState>()
            .map_err(|_| LayerError::Import(format!("handle {} is not a wgpu fence", handle.value)))?;
        Ok(Arc::new(WgpuFence {
            state,
            context: self.context.clone(),
            handle: Some(*handle),
        }))
    }

    fn copy_texture(&self, from: &dyn GraphicsTexture, to: &dyn GraphicsTexture) -> LayerResult<()> {
        self.context.check_lost()?;
        let source = downcast_texture::<WgpuTexture>(from, GraphicsApi::Wgpu)?;
        let destination = downcast_texture::<WgpuTexture>(to, GraphicsApi::Wgpu)?;

        if source.desc.sample_count > 1 && destination.desc.sample_count == 1 {
            return self.resolve(source, destination);
        }
        if source.desc.sample_count != destination.desc.sample_count
            || source.format.remove_srgb_suffix() != destination.format.remove_srgb_suffix()
        {
            return Err(LayerError::Allocation(format!(
                "cannot copy {:?} x{} into {:?} x{}",
                source.format, source.desc.sample_count, destination.format, destination.desc.sample_count
            )));
        }

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Copy Encoder"),
            });
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &destination.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: source.desc.width.min(destination.desc.width),
                height: source.desc.height.min(destination.desc.height),
                depth_or_array_layers: source.desc.array_size.min(destination.desc.array_size),
            },
        );
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn translate_to_generic(&self, native: i64) -> GenericFormat {
        GenericFormat::from_vk(native)
    }

    fn translate_from_generic(&self, format: GenericFormat) -> i64 {
        format.to_vk()
    }

    fn create_composition_device(&self) -> LayerResult<Arc<dyn GraphicsDevice>> {
        self.context.check_lost()?;
        Ok(Arc::new(WgpuDevice {
            id: shared::next_device_id(),
            context: self.context.clone(),
        }))
    }

    fn create_projection_renderer(&self) -> LayerResult<Box<dyn QuadViewRenderer>> {
        Ok(Box::new(GpuRenderer::new(
            self.context.device.clone(),
            self.context.queue.clone(),
        )))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A texture on a [`WgpuDevice`].
pub struct WgpuTexture {
    desc: TextureDesc,
    generic: GenericFormat,
    format: TextureFormat,
    texture: Arc<wgpu::Texture>,
    handle: Option<ShareableHandle>,
}

impl WgpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// 2D view of a single array layer.
    pub fn layer_view(&self, layer: u32) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Layer View"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: layer,
            array_layer_count: Some(1),
            base_mip_level: 0,
            mip_level_count: Some(1),
            ..Default::default()
        })
    }

    fn is_bgra(&self) -> bool {
        matches!(self.format, TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb)
    }

    fn check_8bit(&self) -> LayerResult<()> {
        match self.format {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
                if self.desc.sample_count == 1 =>
            {
                Ok(())
            },
            other => Err(LayerError::Allocation(format!(
                "CPU access needs a single-sample 8-bit texture, got {:?}",
                other
            ))),
        }
    }
}

impl GraphicsTexture for WgpuTexture {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Wgpu
    }

    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn shareable_handle(&self) -> Option<ShareableHandle> {
        self.handle
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn encode_8bit(texel: [f32; 4], bgra: bool, srgb: bool) -> [u8; 4] {
    let encode = |c: f32| {
        let c = if srgb { super::format::linear_to_srgb(c) } else { c };
        (c.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    let [r, g, b, a] = texel;
    let alpha = (a.clamp(0.0, 1.0) * 255.0).round() as u8;
    if bgra {
        [encode(b), encode(g), encode(r), alpha]
    } else {
        [encode(r), encode(g), encode(b), alpha]
    }
}

fn decode_8bit(px: [u8; 4], bgra: bool, srgb: bool) -> [f32; 4] {
    let decode = |v: u8| {
        let c = v as f32 / 255.0;
        if srgb {
            super::format::srgb_to_linear(c)
        } else {
            c
        }
    };
    let (r, b) = if bgra { (px[2], px[0]) } else { (px[0], px[2]) };
    [decode(r), decode(px[1]), decode(b), px[3] as f32 / 255.0]
}

#[derive(Default)]
struct FenceValues {
    /// Highest value queued for signalling.
    signaled: u64,
    /// Highest value whose queued work finished.
    completed: u64,
}

#[derive(Default)]
pub struct WgpuFenceState {
    values: Mutex<FenceValues>,
    cond: Condvar,
}

/// Fence built on queue completion callbacks.
///
/// Every device instance shares one `wgpu::Queue`, so device-side waits are
/// already satisfied by submission order.
pub struct WgpuFence {
    state: Arc<WgpuFenceState>,
    context: Arc<WgpuContext>,
    handle: Option<ShareableHandle>,
}

impl GraphicsFence for WgpuFence {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Wgpu
    }

    fn signal(&self, value: u64) -> LayerResult<()> {
        self.context.check_lost()?;
        {
            let mut values = self.state.values.lock();
            if value < values.signaled {
                return Err(LayerError::InvalidCallOrder(format!(
                    "fence value regression: signal {} after {}",
                    value, values.signaled
                )));
            }
            if value == values.signaled {
                return Ok(());
            }
            values.signaled = value;
            self.state.cond.notify_all();
        }

        let state = self.state.clone();
        self.context.queue.submit([]);
        self.context.queue.on_submitted_work_done(move || {
            let mut values = state.values.lock();
            values.completed = values.completed.max(value);
            state.cond.notify_all();
        });
        Ok(())
    }

    fn wait_on_device(&self, value: u64) -> LayerResult<()> {
        self.context.check_lost()?;
        if self.state.values.lock().signaled < value {
            log::trace!("[GRAPHICS] Device wait for {} ahead of any signal", value);
        }
        Ok(())
    }

    fn wait_on_cpu(&self, value: u64) -> LayerResult<()> {
        loop {
            self.context.check_lost()?;
            {
                let mut values = self.state.values.lock();
                if values.completed >= value {
                    return Ok(());
                }
                if values.signaled < value {
                    self.state.cond.wait(&mut values);
                    continue;
                }
            }
            self.context
                .device
                .poll(wgpu::PollType::Wait)
                .map_err(|e| LayerError::DeviceLost(format!("poll failed: {}", e)))?;
        }
    }

    fn completed_value(&self) -> u64 {
        let _ = self.context.device.poll(wgpu::PollType::Poll);
        self.state.values.lock().completed
    }

    fn shareable_handle(&self) -> Option<ShareableHandle> {
        self.handle
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
