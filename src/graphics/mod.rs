//! Graphics device abstraction.
//!
//! The composition framework works with two devices per session: the
//! application's device (wrapped, never owned) and a composition device created
//! on the same adapter. Both sit behind the same capability interface:
//!
//! - [`GraphicsDevice`]: creates and imports textures and fences, copies
//!   between textures, translates pixel formats, reports its adapter.
//! - [`GraphicsTexture`]: one GPU image plus its creation descriptor and an
//!   optional shareable handle.
//! - [`GraphicsFence`]: a monotonically increasing counter used to order work
//!   between devices.
//!
//! ## Backends
//!
//! - `software`: CPU reference device, used when no GPU API is available and
//!   throughout the tests
//! - `wgpu_device`: wgpu-backed device
//! - `d3d11`: wraps the D3D11 devices of `quadviews-d3d11` (Windows only)

pub mod format;
pub mod shared;
pub mod software;
pub mod wgpu_device;

#[cfg(windows)]
pub mod d3d11;

use std::any::Any;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{LayerError, LayerResult};
use crate::projection::QuadViewRenderer;

pub use format::GenericFormat;
pub use software::{SoftwareDevice, SoftwareFence, SoftwareTexture};
pub use wgpu_device::{WgpuDevice, WgpuFence, WgpuTexture};

/// Graphics API behind a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsApi {
    D3D11,
    Wgpu,
    Software,
}

impl std::fmt::Display for GraphicsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphicsApi::D3D11 => write!(f, "D3D11"),
            GraphicsApi::Wgpu => write!(f, "wgpu"),
            GraphicsApi::Software => write!(f, "Software"),
        }
    }
}

bitflags! {
    /// Texture usage, bit-compatible with `XrSwapchainUsageFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u64 {
        const COLOR_ATTACHMENT = 0x0000_0001;
        const DEPTH_STENCIL_ATTACHMENT = 0x0000_0002;
        const UNORDERED_ACCESS = 0x0000_0004;
        const TRANSFER_SRC = 0x0000_0008;
        const TRANSFER_DST = 0x0000_0010;
        const SAMPLED = 0x0000_0020;
        const MUTABLE_FORMAT = 0x0000_0040;
    }
}

/// Creation descriptor of a texture.
///
/// `format` is a native format code of the device the descriptor is handed to
/// (see [`GraphicsDevice::translate_to_generic`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub format: i64,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Single-layer, single-sample color texture usable for rendering and sampling.
    pub fn color(width: u32, height: u32, format: i64) -> Self {
        Self {
            width,
            height,
            array_size: 1,
            mip_count: 1,
            sample_count: 1,
            format,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED,
        }
    }

    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Same descriptor expressed in another device's native format.
    pub fn translated(&self, from: &dyn GraphicsDevice, to: &dyn GraphicsDevice) -> Self {
        Self {
            format: to.translate_from_generic(from.translate_to_generic(self.format)),
            ..*self
        }
    }

    /// Reject descriptors no device can allocate.
    pub fn check(&self) -> LayerResult<()> {
        if self.width == 0 || self.height == 0 || self.array_size == 0 || self.mip_count == 0 {
            return Err(LayerError::Allocation(format!(
                "empty texture extent {}x{}x{} ({} mips)",
                self.width, self.height, self.array_size, self.mip_count
            )));
        }
        if !self.sample_count.is_power_of_two() {
            return Err(LayerError::Allocation(format!(
                "unsupported sample count {}",
                self.sample_count
            )));
        }
        Ok(())
    }
}

/// Allocation-independent view of a descriptor, used to validate imports
/// across devices that use different native format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedTextureDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub sample_count: u32,
    pub format: GenericFormat,
}

impl SharedTextureDesc {
    pub fn new(desc: &TextureDesc, format: GenericFormat) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            array_size: desc.array_size,
            sample_count: desc.sample_count,
            format,
        }
    }
}

/// Locally unique identifier of a graphics adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AdapterLuid(pub u64);

impl AdapterLuid {
    pub fn from_parts(high: i32, low: u32) -> Self {
        Self(((high as u32 as u64) << 32) | low as u64)
    }
}

impl std::fmt::Display for AdapterLuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}:{:08x}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

/// How a shareable handle is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Kernel (NT) handle owned by the producing device.
    Nt,
    /// Key into the in-process share table.
    InProcess,
}

/// OS-level handle allowing a second device to open a resource.
///
/// The handle is valid only while the producing device instance exists. A
/// consumer never closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareableHandle {
    pub value: u64,
    pub kind: HandleKind,
}

/// A graphics device (application-side or composition-side).
pub trait GraphicsDevice: Send + Sync {
    fn api(&self) -> GraphicsApi;

    fn adapter_luid(&self) -> AdapterLuid;

    /// Create a texture. With `shareable`, the texture carries a handle that
    /// [`GraphicsDevice::open_texture`] accepts on another device.
    fn create_texture(&self, desc: &TextureDesc, shareable: bool) -> LayerResult<Arc<dyn GraphicsTexture>>;

    /// Import a texture created by another device instance.
    fn open_texture(&self, handle: &ShareableHandle, desc: &TextureDesc) -> LayerResult<Arc<dyn GraphicsTexture>>;

    /// Wrap a native texture pointer owned by someone else (runtime swapchain images).
    fn wrap_native_texture(&self, native: usize, desc: &TextureDesc) -> LayerResult<Arc<dyn GraphicsTexture>> {
        let _ = (native, desc);
        Err(LayerError::Import(format!(
            "{} device cannot wrap native textures",
            self.api()
        )))
    }

    fn create_fence(&self, shareable: bool) -> LayerResult<Arc<dyn GraphicsFence>>;

    /// Import a fence created by another device instance.
    fn open_fence(&self, handle: &ShareableHandle) -> LayerResult<Arc<dyn GraphicsFence>>;

    /// Copy `from` into `to` on this device's queue.
    ///
    /// Handles array slices (copies the common layers), multisample resolve,
    /// mismatched extents (copies the common region) and formats differing in
    /// encoding only.
    fn copy_texture(&self, from: &dyn GraphicsTexture, to: &dyn GraphicsTexture) -> LayerResult<()>;

    fn translate_to_generic(&self, native: i64) -> GenericFormat;

    fn translate_from_generic(&self, format: GenericFormat) -> i64;

    /// Create a device for composition on the same adapter.
    fn create_composition_device(&self) -> LayerResult<Arc<dyn GraphicsDevice>>;

    /// Create the quad-view projection pass for this device.
    fn create_projection_renderer(&self) -> LayerResult<Box<dyn QuadViewRenderer>>;

    fn as_any(&self) -> &dyn Any;
}

/// A GPU image owned by one device.
pub trait GraphicsTexture: Send + Sync {
    fn api(&self) -> GraphicsApi;

    /// Creation descriptor, in the owning device's native format codes.
    fn desc(&self) -> &TextureDesc;

    fn shareable_handle(&self) -> Option<ShareableHandle>;

    fn as_any(&self) -> &dyn Any;
}

/// A monotonically increasing counter for device-to-device synchronization.
pub trait GraphicsFence: Send + Sync {
    fn api(&self) -> GraphicsApi;

    /// Queue a signal of `value` on the owning device. Values must not decrease;
    /// signalling the current value again is a no-op.
    fn signal(&self, value: u64) -> LayerResult<()>;

    /// Make the owning device's queue wait for `value`. Returns immediately.
    fn wait_on_device(&self, value: u64) -> LayerResult<()>;

    /// Block the calling thread until the counter reaches `value`.
    fn wait_on_cpu(&self, value: u64) -> LayerResult<()>;

    /// Last value reached by the counter.
    fn completed_value(&self) -> u64;

    fn shareable_handle(&self) -> Option<ShareableHandle>;

    fn as_any(&self) -> &dyn Any;
}

/// Downcast a texture to a backend type, failing with an API mismatch.
pub fn downcast_texture<'a, T: 'static>(
    texture: &'a dyn GraphicsTexture,
    expected: GraphicsApi,
) -> LayerResult<&'a T> {
    texture
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| LayerError::api_mismatch(expected, texture.api()))
}

/// Downcast a fence to a backend type, failing with an API mismatch.
pub fn downcast_fence<'a, T: 'static>(fence: &'a dyn GraphicsFence, expected: GraphicsApi) -> LayerResult<&'a T> {
    fence
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| LayerError::api_mismatch(expected, fence.api()))
}

/// How swapchain contents travel between the application and composition devices.
///
/// Decided once per device pairing, when the session's framework is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingStrategy {
    /// Same adapter: images are opened on both devices, no copies.
    ZeroCopy,
    /// Different adapters: contents go through a shared bounce texture with a
    /// copy and a fence wait on each hand-off.
    CopyAndFence,
}

impl SharingStrategy {
    pub fn select(application: &dyn GraphicsDevice, composition: &dyn GraphicsDevice) -> Self {
        if application.adapter_luid() == composition.adapter_luid() {
            SharingStrategy::ZeroCopy
        } else {
            SharingStrategy::CopyAndFence
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luid_from_parts() {
        let luid = AdapterLuid::from_parts(1, 0x2000);
        assert_eq!(luid.0, 0x0000_0001_0000_2000);
        assert_eq!(luid.to_string(), "00000001:00002000");
    }

    #[test]
    fn test_desc_check() {
        assert!(TextureDesc::color(16, 16, 28).check().is_ok());
        assert!(TextureDesc::color(0, 16, 28).check().is_err());
        assert!(TextureDesc::color(16, 16, 28).with_sample_count(3).check().is_err());
        assert!(TextureDesc::color(16, 16, 28).with_array_size(0).check().is_err());
    }

    #[test]
    fn test_usage_bits_match_runtime() {
        assert_eq!(TextureUsage::COLOR_ATTACHMENT.bits(), 0x1);
        assert_eq!(TextureUsage::SAMPLED.bits(), 0x20);
        assert_eq!(TextureUsage::from_bits_truncate(0x21), TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED);
    }

    #[test]
    fn test_strategy_follows_adapter() {
        let a = SoftwareDevice::new(AdapterLuid(7));
        let b = SoftwareDevice::new(AdapterLuid(7));
        let c = SoftwareDevice::new(AdapterLuid(8));
        assert_eq!(SharingStrategy::select(&a, &b), SharingStrategy::ZeroCopy);
        assert_eq!(SharingStrategy::select(&a, &c), SharingStrategy::CopyAndFence);
    }
}
