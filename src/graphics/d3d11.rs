//! D3D11 backend, on top of `quadviews-d3d11`.
//!
//! Shared textures and fences travel as NT handles. The composition device is
//! a second D3D11 device on the application's adapter.

use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quadviews_d3d11::{
    Device, Fence, ProjectionPass, ProjectionTargets, SharedHandle, SharpenPass, Texture, TextureInfo,
};

use super::format::dxgi_compatible;
use super::{
    downcast_texture, AdapterLuid, GenericFormat, GraphicsApi, GraphicsDevice, GraphicsFence, GraphicsTexture,
    HandleKind, ShareableHandle, TextureDesc, TextureUsage,
};
use crate::error::{LayerError, LayerResult};
use crate::projection::{
    check_sharpen, ProjectionParams, ProjectionUniforms, QuadViewRenderer, SharpenUniforms, ViewSource,
};

fn texture_info(desc: &TextureDesc) -> TextureInfo {
    TextureInfo {
        width: desc.width,
        height: desc.height,
        array_size: desc.array_size,
        mip_levels: desc.mip_count,
        sample_count: desc.sample_count,
        format: desc.format as u32,
        render_target: desc.usage.contains(TextureUsage::COLOR_ATTACHMENT),
        depth_stencil: desc.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT),
        shader_resource: desc.usage.contains(TextureUsage::SAMPLED),
        unordered_access: desc.usage.contains(TextureUsage::UNORDERED_ACCESS),
    }
}

/// Check an opened allocation against the descriptor it was opened with.
fn check_opened(info: &TextureInfo, desc: &TextureDesc) -> LayerResult<()> {
    if info.width != desc.width || info.height != desc.height || info.array_size != desc.array_size {
        return Err(LayerError::Import(format!(
            "shared texture is {}x{}x{}, expected {}x{}x{}",
            info.width, info.height, info.array_size, desc.width, desc.height, desc.array_size
        )));
    }
    if info.sample_count != desc.sample_count {
        return Err(LayerError::Import(format!(
            "shared texture has {} samples, expected {}",
            info.sample_count, desc.sample_count
        )));
    }
    if !dxgi_compatible(info.format as i64, desc.format) {
        return Err(LayerError::Import(format!(
            "shared texture has format {}, expected {}",
            info.format, desc.format
        )));
    }
    Ok(())
}

fn nt_handle(handle: Option<&SharedHandle>) -> Option<ShareableHandle> {
    handle.map(|handle| ShareableHandle {
        value: handle.value(),
        kind: HandleKind::Nt,
    })
}

fn check_nt(handle: &ShareableHandle) -> LayerResult<()> {
    if handle.kind != HandleKind::Nt {
        return Err(LayerError::Import(format!(
            "handle {} is not an NT handle",
            handle.value
        )));
    }
    Ok(())
}

/// A D3D11 device: the application's, or a composition device on its adapter.
pub struct D3D11Device {
    device: Arc<Device>,
}

impl D3D11Device {
    /// Wrap the device from the application's graphics binding.
    pub fn wrap_application(device: *mut c_void) -> LayerResult<Arc<dyn GraphicsDevice>> {
        if device.is_null() {
            return Err(LayerError::Configuration(
                "D3D11 graphics binding has no device".to_string(),
            ));
        }
        // SAFETY: the binding's device is live for the whole session.
        let device = unsafe { Device::from_raw(device) }
            .map_err(|e| LayerError::Configuration(format!("cannot use application D3D11 device: {}", e)))?;
        log::info!(
            "[GRAPHICS] Wrapped application D3D11 device on adapter {}",
            AdapterLuid(device.luid())
        );
        Ok(Arc::new(Self {
            device: Arc::new(device),
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn texture(&self, texture: Texture, desc: &TextureDesc) -> Arc<dyn GraphicsTexture> {
        Arc::new(D3D11Texture {
            handle: nt_handle(texture.shared_handle()),
            texture,
            desc: *desc,
        })
    }
}

impl GraphicsDevice for D3D11Device {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::D3D11
    }

    fn adapter_luid(&self) -> AdapterLuid {
        AdapterLuid(self.device.luid())
    }

    fn create_texture(&self, desc: &TextureDesc, shareable: bool) -> LayerResult<Arc<dyn GraphicsTexture>> {
        desc.check()?;
        if self.translate_to_generic(desc.format) == GenericFormat::Unknown {
            return Err(LayerError::Allocation(format!("unsupported format {}", desc.format)));
        }
        let texture = self
            .device
            .create_texture(&texture_info(desc), shareable)
            .map_err(|e| LayerError::Allocation(e.to_string()))?;
        Ok(self.texture(texture, desc))
    }

    fn open_texture(&self, handle: &ShareableHandle, desc: &TextureDesc) -> LayerResult<Arc<dyn GraphicsTexture>> {
        check_nt(handle)?;
        let texture = self
            .device
            .open_texture(SharedHandle::from_value(handle.value))
            .map_err(|e| LayerError::Import(e.to_string()))?;
        check_opened(texture.info(), desc)?;
        Ok(Arc::new(D3D11Texture {
            texture: texture.with_view_format(desc.format as u32),
            desc: *desc,
            handle: Some(*handle),
        }))
    }

    fn wrap_native_texture(&self, native: usize, desc: &TextureDesc) -> LayerResult<Arc<dyn GraphicsTexture>> {
        // SAFETY: runtime swapchain images stay alive until the swapchain is destroyed.
        let texture = unsafe { self.device.wrap_texture(native as *mut c_void, &texture_info(desc)) }
            .map_err(|e| LayerError::Import(e.to_string()))?;
        Ok(self.texture(texture, desc))
    }

    fn create_fence(&self, shareable: bool) -> LayerResult<Arc<dyn GraphicsFence>> {
        let fence = self
            .device
            .create_fence(shareable)
            .map_err(|e| LayerError::Allocation(e.to_string()))?;
        Ok(Arc::new(D3D11Fence {
            handle: nt_handle(fence.shared_handle()),
            fence,
            device: self.device.clone(),
            queued: QueuedValue::default(),
        }))
    }

    fn open_fence(&self, handle: &ShareableHandle) -> LayerResult<Arc<dyn GraphicsFence>> {
        check_nt(handle)?;
        let fence = self
            .device
            .open_fence(SharedHandle::from_value(handle.value))
            .map_err(|e| LayerError::Import(e.to_string()))?;
        Ok(Arc::new(D3D11Fence {
            fence,
            device: self.device.clone(),
            handle: Some(*handle),
            queued: QueuedValue::default(),
        }))
    }

    fn copy_texture(&self, from: &dyn GraphicsTexture, to: &dyn GraphicsTexture) -> LayerResult<()> {
        let source = downcast_texture::<D3D11Texture>(from, GraphicsApi::D3D11)?;
        let destination = downcast_texture::<D3D11Texture>(to, GraphicsApi::D3D11)?;
        self.device
            .copy(&source.texture, &destination.texture)
            .map_err(|e| LayerError::DeviceLost(e.to_string()))
    }

    fn translate_to_generic(&self, native: i64) -> GenericFormat {
        GenericFormat::from_dxgi(native)
    }

    fn translate_from_generic(&self, format: GenericFormat) -> i64 {
        format.to_dxgi()
    }

    fn create_composition_device(&self) -> LayerResult<Arc<dyn GraphicsDevice>> {
        let device = Device::create_on_adapter(self.device.luid())
            .map_err(|e| LayerError::Allocation(format!("cannot create composition device: {}", e)))?;
        Ok(Arc::new(Self {
            device: Arc::new(device),
        }))
    }

    fn create_projection_renderer(&self) -> LayerResult<Box<dyn QuadViewRenderer>> {
        let pass = self
            .device
            .create_projection_pass()
            .map_err(|e| LayerError::Allocation(e.to_string()))?;
        let sharpen = self
            .device
            .create_sharpen_pass()
            .map_err(|e| LayerError::Allocation(e.to_string()))?;
        Ok(Box::new(D3D11Renderer {
            device: self.device.clone(),
            pass,
            sharpen,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct D3D11Texture {
    texture: Texture,
    desc: TextureDesc,
    handle: Option<ShareableHandle>,
}

impl D3D11Texture {
    pub fn texture(&self) -> &Texture {
        &self.texture
    }
}

impl GraphicsTexture for D3D11Texture {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::D3D11
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

/// Highest value a signal was queued for through one fence wrapper.
#[derive(Debug, Default)]
struct QueuedValue(AtomicU64);

impl QueuedValue {
    /// Claim `value` for a new signal. Fails when it is below a value already
    /// queued or completed.
    fn claim(&self, value: u64, completed: u64) -> LayerResult<()> {
        let floor = self.0.fetch_max(value, Ordering::AcqRel).max(completed);
        if value < floor {
            return Err(LayerError::InvalidCallOrder(format!(
                "fence value regression: signal {} after {}",
                value, floor
            )));
        }
        Ok(())
    }
}

pub struct D3D11Fence {
    fence: Fence,
    device: Arc<Device>,
    handle: Option<ShareableHandle>,
    queued: QueuedValue,
}

impl GraphicsFence for D3D11Fence {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::D3D11
    }

    fn signal(&self, value: u64) -> LayerResult<()> {
        self.queued.claim(value, self.fence.completed_value())?;
        self.device
            .signal(&self.fence, value)
            .map_err(|e| LayerError::DeviceLost(e.to_string()))
    }

    fn wait_on_device(&self, value: u64) -> LayerResult<()> {
        self.device
            .wait(&self.fence, value)
            .map_err(|e| LayerError::DeviceLost(e.to_string()))
    }

    fn wait_on_cpu(&self, value: u64) -> LayerResult<()> {
        self.fence
            .wait_on_cpu(value)
            .map_err(|e| LayerError::DeviceLost(e.to_string()))
    }

    fn completed_value(&self) -> u64 {
        self.fence.completed_value()
    }

    fn shareable_handle(&self) -> Option<ShareableHandle> {
        self.handle
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Projection and sharpening passes compiled for one D3D11 device.
pub struct D3D11Renderer {
    device: Arc<Device>,
    pass: ProjectionPass,
    sharpen: SharpenPass,
}

impl QuadViewRenderer for D3D11Renderer {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::D3D11
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
        if output.texture.desc().sample_count != 1 {
            return Err(LayerError::Configuration(
                "projection output must be single-sampled".to_string(),
            ));
        }

        let uniforms = ProjectionUniforms::new(&peripheral, &focus, params);
        let rect = output.rect;
        let targets = ProjectionTargets {
            peripheral: &downcast_texture::<D3D11Texture>(peripheral.texture, GraphicsApi::D3D11)?.texture,
            peripheral_layer: peripheral.layer,
            focus: &downcast_texture::<D3D11Texture>(focus.texture, GraphicsApi::D3D11)?.texture,
            focus_layer: focus.layer,
            output: &downcast_texture::<D3D11Texture>(output.texture, GraphicsApi::D3D11)?.texture,
            output_layer: output.layer,
            viewport: [rect.x as f32, rect.y as f32, rect.width as f32, rect.height as f32],
        };
        self.pass
            .render(&self.device, &targets, bytemuck::bytes_of(&uniforms))
            .map_err(|e| LayerError::DeviceLost(e.to_string()))
    }

    fn sharpen(&mut self, source: ViewSource<'_>, output: ViewSource<'_>, sharpness: f32) -> LayerResult<()> {
        check_sharpen(&source, &output)?;

        let uniforms = SharpenUniforms::new(&source, &output, sharpness);
        let rect = output.rect;
        let source_texture = &downcast_texture::<D3D11Texture>(source.texture, GraphicsApi::D3D11)?.texture;
        let output_texture = &downcast_texture::<D3D11Texture>(output.texture, GraphicsApi::D3D11)?.texture;
        self.sharpen
            .render(
                &self.device,
                (source_texture, source.layer),
                (output_texture, output.layer),
                [rect.x as f32, rect.y as f32, rect.width as f32, rect.height as f32],
                bytemuck::bytes_of(&uniforms),
            )
            .map_err(|e| LayerError::DeviceLost(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32, format: u32, sample_count: u32) -> TextureInfo {
        TextureInfo {
            width,
            height,
            array_size: 1,
            mip_levels: 1,
            sample_count,
            format,
            render_target: true,
            depth_stencil: false,
            shader_resource: true,
            unordered_access: false,
        }
    }

    #[test]
    fn test_open_rejects_wrong_format() {
        let desc = TextureDesc::color(64, 64, 91);
        let err = check_opened(&info(64, 64, 28, 1), &desc).unwrap_err();
        assert!(matches!(err, LayerError::Import(_)));
    }

    #[test]
    fn test_open_accepts_typeless_family() {
        // R8G8B8A8_TYPELESS storage viewed as R8G8B8A8_UNORM_SRGB.
        check_opened(&info(64, 64, 27, 1), &TextureDesc::color(64, 64, 29)).unwrap();
        check_opened(&info(64, 64, 28, 1), &TextureDesc::color(64, 64, 28)).unwrap();
    }

    #[test]
    fn test_open_rejects_wrong_extent_or_samples() {
        let desc = TextureDesc::color(64, 64, 28);
        assert!(check_opened(&info(32, 64, 28, 1), &desc).is_err());
        assert!(check_opened(&info(64, 64, 28, 4), &desc).is_err());
    }

    #[test]
    fn test_signal_below_queued_value_fails() {
        let queued = QueuedValue::default();
        queued.claim(5, 3).unwrap();
        assert!(matches!(queued.claim(4, 3), Err(LayerError::InvalidCallOrder(_))));
        queued.claim(5, 3).unwrap();
        queued.claim(6, 5).unwrap();
        assert!(queued.claim(2, 7).is_err());
    }
}
