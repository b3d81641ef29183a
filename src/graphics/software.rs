//! Software reference device.
//!
//! Textures live in host memory as linear `f32` RGBA texels and are quantized
//! to their format on every write, so results match what an 8-bit or sRGB
//! render target would hold. The device queue executes work inline on the
//! calling thread: a [`GraphicsFence::wait_on_device`] is recorded and only
//! resolved (blocking) when the next queue operation starts.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use super::shared::{self, SharedKind};
use super::{
    downcast_texture, AdapterLuid, GenericFormat, GraphicsApi, GraphicsDevice, GraphicsFence, GraphicsTexture,
    ShareableHandle, SharedTextureDesc, TextureDesc, TextureUsage,
};
use crate::error::{LayerError, LayerResult};
use crate::projection::cpu::CpuRenderer;
use crate::projection::QuadViewRenderer;

/// Largest texture dimension the software device accepts.
const MAX_TEXTURE_DIMENSION: u32 = 16384;

/// Queue state shared by a device, its fences and its renderer.
pub struct SoftwareQueue {
    id: u64,
    luid: AdapterLuid,
    pending_waits: Mutex<Vec<(Arc<FenceState>, u64)>>,
    lost: AtomicBool,
}

impl SoftwareQueue {
    fn check_lost(&self) -> LayerResult<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(LayerError::DeviceLost(format!("software device {}", self.id)))
        } else {
            Ok(())
        }
    }

    /// Start a queue operation: resolve every recorded device-side wait.
    pub(crate) fn begin(&self) -> LayerResult<()> {
        self.check_lost()?;
        let waits = std::mem::take(&mut *self.pending_waits.lock());
        for (fence, value) in waits {
            fence.wait(value);
        }
        self.check_lost()
    }
}

/// CPU reference implementation of [`GraphicsDevice`].
pub struct SoftwareDevice {
    queue: Arc<SoftwareQueue>,
}

impl SoftwareDevice {
    pub fn new(luid: AdapterLuid) -> Self {
        let id = shared::next_device_id();
        log::debug!("[GRAPHICS] Created software device {} on adapter {}", id, luid);
        Self {
            queue: Arc::new(SoftwareQueue {
                id,
                luid,
                pending_waits: Mutex::new(Vec::new()),
                lost: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Simulate a device removal. Every later queue operation fails.
    pub fn mark_lost(&self) {
        log::warn!("[GRAPHICS] Software device {} marked as lost", self.queue.id);
        self.queue.lost.store(true, Ordering::Release);
    }

    /// Number of device-side waits recorded but not yet resolved.
    pub fn pending_waits(&self) -> usize {
        self.queue.pending_waits.lock().len()
    }

    fn new_texture(
        &self,
        desc: &TextureDesc,
        format: GenericFormat,
        storage: Arc<TextureStorage>,
        handle: Option<ShareableHandle>,
    ) -> Arc<dyn GraphicsTexture> {
        Arc::new(SoftwareTexture {
            desc: *desc,
            format,
            storage,
            handle,
        })
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        shared::retire_owner(self.queue.id);
    }
}

impl GraphicsDevice for SoftwareDevice {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Software
    }

    fn adapter_luid(&self) -> AdapterLuid {
        self.queue.luid
    }

    fn create_texture(&self, desc: &TextureDesc, shareable: bool) -> LayerResult<Arc<dyn GraphicsTexture>> {
        self.queue.check_lost()?;
        desc.check()?;

        let format = self.translate_to_generic(desc.format);
        if format == GenericFormat::Unknown {
            return Err(LayerError::Allocation(format!("unsupported format {}", desc.format)));
        }
        if format.is_depth() && desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            return Err(LayerError::Allocation(format!(
                "{} cannot be used as a color attachment",
                format
            )));
        }
        if !format.is_depth() && desc.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
            return Err(LayerError::Allocation(format!(
                "{} cannot be used as a depth attachment",
                format
            )));
        }
        if desc.width > MAX_TEXTURE_DIMENSION || desc.height > MAX_TEXTURE_DIMENSION {
            return Err(LayerError::Allocation(format!(
                "texture extent {}x{} exceeds {}",
                desc.width, desc.height, MAX_TEXTURE_DIMENSION
            )));
        }

        let storage = Arc::new(TextureStorage::new(desc));
        let handle = shareable.then(|| {
            shared::publish(
                self.queue.id,
                GraphicsApi::Software,
                self.queue.luid,
                SharedKind::Texture(SharedTextureDesc::new(desc, format)),
                storage.clone(),
            )
        });

        log::trace!(
            "[GRAPHICS] Software device {} created {}x{}x{} {} texture (shareable: {})",
            self.queue.id,
            desc.width,
            desc.height,
            desc.array_size,
            format,
            shareable
        );
        Ok(self.new_texture(desc, format, storage, handle))
    }

    fn open_texture(&self, handle: &ShareableHandle, desc: &TextureDesc) -> LayerResult<Arc<dyn GraphicsTexture>> {
        self.queue.check_lost()?;
        let format = self.translate_to_generic(desc.format);
        let payload = shared::open_texture(
            handle,
            GraphicsApi::Software,
            self.queue.luid,
            &SharedTextureDesc::new(desc, format),
        )?;
        let storage = payload
            .downcast::<TextureStorage>()
            .map_err(|_| LayerError::Import(format!("handle {} is not a software texture", handle.value)))?;
        Ok(self.new_texture(desc, format, storage, Some(*handle)))
    }

    fn create_fence(&self, shareable: bool) -> LayerResult<Arc<dyn GraphicsFence>> {
        self.queue.check_lost()?;
        let state = Arc::new(FenceState::default());
        let handle = shareable.then(|| {
            shared::publish(
                self.queue.id,
                GraphicsApi::Software,
                self.queue.luid,
                SharedKind::Fence,
                state.clone(),
            )
        });
        Ok(Arc::new(SoftwareFence {
            state,
            queue: self.queue.clone(),
            handle,
        }))
    }

    fn open_fence(&self, handle: &ShareableHandle) -> LayerResult<Arc<dyn GraphicsFence>> {
        self.queue.check_lost()?;
        let payload = shared::open_fence(handle, GraphicsApi::Software, self.queue.luid)?;
        let state = payload
            .downcast::<FenceState>()
            .map_err(|_| LayerError::Import(format!("handle {} is not a software fence", handle.value)))?;
        Ok(Arc::new(SoftwareFence {
            state,
            queue: self.queue.clone(),
            handle: Some(*handle),
        }))
    }

    fn copy_texture(&self, from: &dyn GraphicsTexture, to: &dyn GraphicsTexture) -> LayerResult<()> {
        let source = downcast_texture::<SoftwareTexture>(from, GraphicsApi::Software)?;
        let destination = downcast_texture::<SoftwareTexture>(to, GraphicsApi::Software)?;
        if source.format.is_depth() != destination.format.is_depth() {
            return Err(LayerError::Allocation(format!(
                "cannot copy {} into {}",
                source.format, destination.format
            )));
        }

        self.queue.begin()?;

        let width = source.storage.width.min(destination.storage.width);
        let height = source.storage.height.min(destination.storage.height);
        let layers = source.storage.layers.min(destination.storage.layers);
        for layer in 0..layers {
            for y in 0..height {
                for x in 0..width {
                    let texel = source.storage.resolved(layer, x, y);
                    destination.storage.store(layer, x, y, destination.format.quantize(texel));
                }
            }
        }
        Ok(())
    }

    fn translate_to_generic(&self, native: i64) -> GenericFormat {
        GenericFormat::from_dxgi(native)
    }

    fn translate_from_generic(&self, format: GenericFormat) -> i64 {
        format.to_dxgi()
    }

    fn create_composition_device(&self) -> LayerResult<Arc<dyn GraphicsDevice>> {
        Ok(Arc::new(SoftwareDevice::new(self.queue.luid)))
    }

    fn create_projection_renderer(&self) -> LayerResult<Box<dyn QuadViewRenderer>> {
        Ok(Box::new(CpuRenderer::new(self.queue.clone())))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Host-memory texels of one allocation, shared by every device that opened it.
pub struct TextureStorage {
    width: u32,
    height: u32,
    layers: u32,
    samples: u32,
    texels: RwLock<Vec<[f32; 4]>>,
}

impl TextureStorage {
    fn new(desc: &TextureDesc) -> Self {
        let count = desc.width as usize * desc.height as usize * desc.array_size as usize * desc.sample_count as usize;
        Self {
            width: desc.width,
            height: desc.height,
            layers: desc.array_size,
            samples: desc.sample_count,
            texels: RwLock::new(vec![[0.0; 4]; count]),
        }
    }

    fn index(&self, layer: u32, sample: u32, x: u32, y: u32) -> usize {
        (((layer * self.samples + sample) * self.height + y) * self.width + x) as usize
    }

    /// Texel value with multisample resolve (average of all samples).
    fn resolved(&self, layer: u32, x: u32, y: u32) -> [f32; 4] {
        let texels = self.texels.read();
        let mut sum = [0.0f32; 4];
        for sample in 0..self.samples {
            let texel = texels[self.index(layer, sample, x, y)];
            for (acc, c) in sum.iter_mut().zip(texel) {
                *acc += c;
            }
        }
        sum.map(|c| c / self.samples as f32)
    }

    /// Write a texel to every sample.
    fn store(&self, layer: u32, x: u32, y: u32, value: [f32; 4]) {
        let mut texels = self.texels.write();
        for sample in 0..self.samples {
            let index = self.index(layer, sample, x, y);
            texels[index] = value;
        }
    }
}

/// A texture on the software device.
pub struct SoftwareTexture {
    desc: TextureDesc,
    format: GenericFormat,
    storage: Arc<TextureStorage>,
    handle: Option<ShareableHandle>,
}

impl SoftwareTexture {
    pub fn format(&self) -> GenericFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.storage.width
    }

    pub fn height(&self) -> u32 {
        self.storage.height
    }

    /// Whether both textures are views of the same memory.
    pub fn shares_storage_with(&self, other: &SoftwareTexture) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    fn check_layer(&self, layer: u32) -> LayerResult<()> {
        if layer >= self.storage.layers {
            return Err(LayerError::InvalidCallOrder(format!(
                "array layer {} out of range ({} layers)",
                layer, self.storage.layers
            )));
        }
        Ok(())
    }

    /// Resolved texel at integer coordinates (clamped to the extent).
    pub fn texel(&self, layer: u32, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.storage.width - 1);
        let y = y.min(self.storage.height - 1);
        let layer = layer.min(self.storage.layers - 1);
        self.storage.resolved(layer, x, y)
    }

    /// Write a texel, quantized to the texture format.
    pub fn write_texel(&self, layer: u32, x: u32, y: u32, value: [f32; 4]) -> LayerResult<()> {
        self.check_layer(layer)?;
        if x >= self.storage.width || y >= self.storage.height {
            return Err(LayerError::InvalidCallOrder(format!(
                "texel ({}, {}) outside {}x{}",
                x, y, self.storage.width, self.storage.height
            )));
        }
        self.storage.store(layer, x, y, self.format.quantize(value));
        Ok(())
    }

    /// Row-major resolved texels of one array layer.
    pub fn read_layer(&self, layer: u32) -> LayerResult<Vec<[f32; 4]>> {
        self.check_layer(layer)?;
        let mut out = Vec::with_capacity((self.storage.width * self.storage.height) as usize);
        for y in 0..self.storage.height {
            for x in 0..self.storage.width {
                out.push(self.storage.resolved(layer, x, y));
            }
        }
        Ok(out)
    }

    /// Overwrite one array layer from row-major texels.
    pub fn write_layer(&self, layer: u32, texels: &[[f32; 4]]) -> LayerResult<()> {
        self.check_layer(layer)?;
        let expected = (self.storage.width * self.storage.height) as usize;
        if texels.len() != expected {
            return Err(LayerError::InvalidCallOrder(format!(
                "expected {} texels, got {}",
                expected,
                texels.len()
            )));
        }
        for (i, texel) in texels.iter().enumerate() {
            let x = i as u32 % self.storage.width;
            let y = i as u32 / self.storage.width;
            self.storage.store(layer, x, y, self.format.quantize(*texel));
        }
        Ok(())
    }

    /// Fill every layer with one color.
    pub fn fill(&self, value: [f32; 4]) {
        let value = self.format.quantize(value);
        self.storage.texels.write().fill(value);
    }
}

impl GraphicsTexture for SoftwareTexture {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Software
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

#[derive(Default)]
pub struct FenceState {
    value: Mutex<u64>,
    cond: Condvar,
}

impl FenceState {
    fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.cond.wait(&mut current);
        }
    }
}

/// A fence on the software device.
pub struct SoftwareFence {
    state: Arc<FenceState>,
    queue: Arc<SoftwareQueue>,
    handle: Option<ShareableHandle>,
}

impl GraphicsFence for SoftwareFence {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Software
    }

    fn signal(&self, value: u64) -> LayerResult<()> {
        self.queue.begin()?;
        let mut current = self.state.value.lock();
        if value < *current {
            return Err(LayerError::InvalidCallOrder(format!(
                "fence value regression: signal {} after {}",
                value, *current
            )));
        }
        if value > *current {
            *current = value;
            self.state.cond.notify_all();
        }
        Ok(())
    }

    fn wait_on_device(&self, value: u64) -> LayerResult<()> {
        self.queue.check_lost()?;
        if *self.state.value.lock() < value {
            self.queue.pending_waits.lock().push((self.state.clone(), value));
        }
        Ok(())
    }

    fn wait_on_cpu(&self, value: u64) -> LayerResult<()> {
        self.queue.check_lost()?;
        self.state.wait(value);
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        *self.state.value.lock()
    }

    fn shareable_handle(&self) -> Option<ShareableHandle> {
        self.handle
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
