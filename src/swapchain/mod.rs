//! Swapchains shared between the application and composition devices.
//!
//! A swapchain is a ring of images. Each image has a texture on the
//! application device and the view(s) the composition device reads from and
//! writes into. Two variants exist:
//!
//! - [`SubmittableSwapchain`]: backed by a runtime swapchain, so the result can
//!   be handed to the runtime. The runtime release is deferred while the
//!   composition may still read or write the image.
//! - [`PrivateSwapchain`]: textures the layer allocates itself, never seen by
//!   the runtime.

mod private;
mod slots;
mod submittable;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use openxr_sys as xr;

use crate::error::LayerResult;
use crate::graphics::{GraphicsDevice, GraphicsFence, GraphicsTexture, TextureDesc};

pub use private::PrivateSwapchain;
pub use slots::{SlotState, SlotTable};
pub use submittable::SubmittableSwapchain;

bitflags! {
    /// How a swapchain is used by the composition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SwapchainMode: u32 {
        /// Images are handed to the runtime.
        const SUBMIT = 0x1;
        /// The composition reads released images.
        const READ = 0x2;
        /// The composition writes released images.
        const WRITE = 0x4;
    }
}

/// One image of a swapchain.
pub struct SwapchainImage {
    index: u32,
    application: Arc<dyn GraphicsTexture>,
    read: Arc<dyn GraphicsTexture>,
    write: Arc<dyn GraphicsTexture>,
}

impl SwapchainImage {
    pub fn new(
        index: u32,
        application: Arc<dyn GraphicsTexture>,
        read: Arc<dyn GraphicsTexture>,
        write: Arc<dyn GraphicsTexture>,
    ) -> Self {
        Self {
            index,
            application,
            read,
            write,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Texture on the application device.
    pub fn application_texture(&self) -> &Arc<dyn GraphicsTexture> {
        &self.application
    }

    /// Texture the composition device reads from.
    pub fn read_texture(&self) -> &Arc<dyn GraphicsTexture> {
        &self.read
    }

    /// Texture the composition device writes into.
    pub fn write_texture(&self) -> &Arc<dyn GraphicsTexture> {
        &self.write
    }
}

impl std::fmt::Debug for SwapchainImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapchainImage")
            .field("index", &self.index)
            .field("desc", self.application.desc())
            .finish()
    }
}

/// An image ring shared between the application and composition devices.
pub trait Swapchain: Send + Sync {
    /// Acquire the next image in ring order.
    ///
    /// Without `wait`, fails with [`crate::error::LayerError::Busy`] when that
    /// image is still acquired. With `wait`, blocks until it is released and
    /// also waits for the image to be ready.
    fn acquire_image(&self, wait: bool) -> LayerResult<u32>;

    /// Wait for the oldest acquired image to be ready for rendering.
    fn wait_image(&self) -> LayerResult<()>;

    /// Release the oldest acquired image.
    fn release_image(&self) -> LayerResult<()>;

    /// The most recently released image, not yet committed.
    ///
    /// Orders the application device's work before composition reads.
    fn last_released_image(&self) -> LayerResult<Option<Arc<SwapchainImage>>>;

    /// Hand the last released image back. No-op when nothing is pending.
    fn commit_last_released_image(&self) -> LayerResult<()>;

    fn image(&self, index: u32) -> LayerResult<Arc<SwapchainImage>>;

    fn len(&self) -> u32;

    /// Descriptor on the composition device.
    fn desc(&self) -> &TextureDesc;

    /// Native format on the application device.
    fn application_format(&self) -> i64;

    fn mode(&self) -> SwapchainMode;

    /// Runtime handle of a submittable swapchain.
    fn handle(&self) -> LayerResult<xr::Swapchain>;

    /// Whole-image sub-image for submission to the runtime.
    fn sub_image(&self) -> LayerResult<xr::SwapchainSubImage> {
        let desc = self.desc();
        Ok(xr::SwapchainSubImage {
            swapchain: self.handle()?,
            image_rect: xr::Rect2Di {
                offset: xr::Offset2Di { x: 0, y: 0 },
                extent: xr::Extent2Di {
                    width: desc.width as i32,
                    height: desc.height as i32,
                },
            },
            image_array_index: 0,
        })
    }
}

/// Fence shared by the application and composition devices.
///
/// Created on the composition device and opened on the application device.
/// Each hand-off signals the next value on one side and waits for it on the
/// other. A value whose signal failed is skipped, never waited on.
pub struct FencePair {
    application: Arc<dyn GraphicsFence>,
    composition: Arc<dyn GraphicsFence>,
    value: AtomicU64,
    /// Highest value a device accepted a signal for.
    signaled: AtomicU64,
}

impl FencePair {
    pub fn new(application: &dyn GraphicsDevice, composition: &dyn GraphicsDevice) -> LayerResult<Self> {
        let composition_fence = composition.create_fence(true)?;
        let handle = composition_fence
            .shareable_handle()
            .ok_or_else(|| crate::error::LayerError::Import("composition fence is not shareable".to_string()))?;
        let application_fence = application.open_fence(&handle)?;
        Ok(Self {
            application: application_fence,
            composition: composition_fence,
            value: AtomicU64::new(0),
            signaled: AtomicU64::new(0),
        })
    }

    fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last value handed out, signaled or not.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Last value a signal was queued for.
    pub fn signaled(&self) -> u64 {
        self.signaled.load(Ordering::Acquire)
    }

    fn signal(&self, fence: &dyn GraphicsFence, value: u64) -> LayerResult<()> {
        fence.signal(value)?;
        self.signaled.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Order application device work before composition device work.
    pub fn application_to_composition(&self) -> LayerResult<u64> {
        let value = self.next();
        self.signal(self.application.as_ref(), value)?;
        self.composition.wait_on_device(value)?;
        Ok(value)
    }

    /// Order composition device work before application device work.
    pub fn composition_to_application(&self) -> LayerResult<u64> {
        let value = self.next();
        self.signal(self.composition.as_ref(), value)?;
        self.application.wait_on_device(value)?;
        Ok(value)
    }

    /// Block until both devices reached the last signaled value.
    pub fn drain(&self) {
        let value = self.signaled();
        for fence in [&self.application, &self.composition] {
            if let Err(e) = fence.wait_on_cpu(value) {
                log::warn!("[SWAPCHAIN] Fence drain at {} failed: {}", value, e);
            }
        }
    }
}
