//! Runtime-backed swapchain.

use std::sync::Arc;

use openxr_sys as xr;
use parking_lot::Mutex;

use super::{FencePair, SlotTable, Swapchain, SwapchainImage, SwapchainMode};
use crate::error::{LayerError, LayerResult};
use crate::graphics::{GraphicsDevice, GraphicsTexture, SharingStrategy, TextureDesc};
use crate::runtime::RuntimeDispatch;

/// Shared texture used when application images cannot be opened directly.
struct BounceTexture {
    application: Arc<dyn GraphicsTexture>,
    composition: Arc<dyn GraphicsTexture>,
}

/// Swapchain backed by a runtime swapchain.
///
/// With [`SwapchainMode::READ`] or [`SwapchainMode::WRITE`], the runtime
/// release is held back until [`Swapchain::commit_last_released_image`] so
/// the composition can use the image in between.
pub struct SubmittableSwapchain {
    handle: xr::Swapchain,
    owned: bool,
    runtime: Arc<dyn RuntimeDispatch>,
    application_device: Arc<dyn GraphicsDevice>,
    mode: SwapchainMode,
    desc: TextureDesc,
    application_format: i64,
    images: Vec<Arc<SwapchainImage>>,
    bounce: Option<BounceTexture>,
    fences: FencePair,
    slots: SlotTable,
    /// Released by the application, runtime release deferred.
    pending: Mutex<Option<u32>>,
}

impl SubmittableSwapchain {
    /// Create a runtime swapchain described by `desc` (application-device
    /// format) and wrap it.
    pub fn create(
        runtime: Arc<dyn RuntimeDispatch>,
        session: xr::Session,
        application_device: Arc<dyn GraphicsDevice>,
        composition_device: Arc<dyn GraphicsDevice>,
        desc: &TextureDesc,
        mode: SwapchainMode,
        strategy: SharingStrategy,
    ) -> LayerResult<Self> {
        desc.check()?;
        let handle = runtime.create_swapchain(session, desc)?;
        Self::wrap(
            runtime.clone(),
            handle,
            true,
            application_device,
            composition_device,
            desc,
            mode,
            strategy,
        )
        .inspect_err(|e| {
            log::error!("[SWAPCHAIN] Wrapping new runtime swapchain failed: {}", e);
            if let Err(e) = runtime.destroy_swapchain(handle) {
                log::warn!("[SWAPCHAIN] Destroying runtime swapchain failed: {}", e);
            }
        })
    }

    /// Wrap a swapchain the application created. The runtime swapchain stays
    /// owned by the application.
    pub fn open(
        runtime: Arc<dyn RuntimeDispatch>,
        handle: xr::Swapchain,
        application_device: Arc<dyn GraphicsDevice>,
        composition_device: Arc<dyn GraphicsDevice>,
        desc: &TextureDesc,
        mode: SwapchainMode,
        strategy: SharingStrategy,
    ) -> LayerResult<Self> {
        Self::wrap(
            runtime,
            handle,
            false,
            application_device,
            composition_device,
            desc,
            mode,
            strategy,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap(
        runtime: Arc<dyn RuntimeDispatch>,
        handle: xr::Swapchain,
        owned: bool,
        application_device: Arc<dyn GraphicsDevice>,
        composition_device: Arc<dyn GraphicsDevice>,
        desc: &TextureDesc,
        mode: SwapchainMode,
        strategy: SharingStrategy,
    ) -> LayerResult<Self> {
        let textures = runtime.enumerate_swapchain_images(handle, application_device.as_ref(), desc)?;
        if textures.is_empty() {
            return Err(LayerError::Allocation("runtime swapchain has no images".to_string()));
        }

        let composition_desc = desc.translated(application_device.as_ref(), composition_device.as_ref());
        let mut bounce: Option<BounceTexture> = None;
        let mut images = Vec::with_capacity(textures.len());
        for (index, texture) in textures.into_iter().enumerate() {
            let shared = match (strategy, texture.shareable_handle()) {
                (SharingStrategy::ZeroCopy, Some(handle)) => {
                    Some(composition_device.open_texture(&handle, &composition_desc)?)
                },
                _ => None,
            };

            let composition_texture = match shared {
                Some(texture) => texture,
                None => {
                    if bounce.is_none() {
                        bounce = Some(Self::create_bounce(
                            application_device.as_ref(),
                            composition_device.as_ref(),
                            desc,
                            &composition_desc,
                        )?);
                    }
                    bounce
                        .as_ref()
                        .map(|b| b.composition.clone())
                        .ok_or_else(|| LayerError::Other("bounce texture missing".to_string()))?
                },
            };

            images.push(Arc::new(SwapchainImage::new(
                index as u32,
                texture,
                composition_texture.clone(),
                composition_texture,
            )));
        }

        let fences = FencePair::new(application_device.as_ref(), composition_device.as_ref())?;

        log::info!(
            "[SWAPCHAIN] Runtime swapchain {:?}: {} images {}x{} format {} mode {:?}{}",
            handle,
            images.len(),
            desc.width,
            desc.height,
            desc.format,
            mode,
            if bounce.is_some() { " (bounce copy)" } else { "" }
        );

        Ok(Self {
            handle,
            owned,
            slots: SlotTable::new(format!("swapchain {:?}", handle), images.len() as u32),
            runtime,
            application_device,
            mode,
            desc: composition_desc,
            application_format: desc.format,
            images,
            bounce,
            fences,
            pending: Mutex::new(None),
        })
    }

    fn create_bounce(
        application_device: &dyn GraphicsDevice,
        composition_device: &dyn GraphicsDevice,
        desc: &TextureDesc,
        composition_desc: &TextureDesc,
    ) -> LayerResult<BounceTexture> {
        let composition = composition_device.create_texture(composition_desc, true)?;
        let handle = composition
            .shareable_handle()
            .ok_or_else(|| LayerError::Import("bounce texture is not shareable".to_string()))?;
        let application = application_device.open_texture(&handle, desc)?;
        Ok(BounceTexture {
            application,
            composition,
        })
    }

    /// Whether images travel through a bounce texture.
    pub fn uses_bounce_texture(&self) -> bool {
        self.bounce.is_some()
    }

    fn defers_release(&self) -> bool {
        self.mode.intersects(SwapchainMode::READ | SwapchainMode::WRITE)
    }

    fn release_to_runtime(&self, index: u32) -> LayerResult<()> {
        log::trace!("[SWAPCHAIN] Releasing image {} of {:?} to the runtime", index, self.handle);
        self.runtime.release_swapchain_image(self.handle)
    }

    /// Hand discarded images back once nothing the application holds is
    /// ahead of them.
    fn release_discarded(&self) {
        let discarded = self.slots.take_discarded();
        if discarded.is_empty() {
            return;
        }

        // The deferred image is older in the runtime's order.
        let pending = self.pending.lock().take();
        if let Some(index) = pending {
            log::debug!("[SWAPCHAIN] Image {} released early behind a failed acquire", index);
            if self.slots.last_released() == Some(index) {
                self.slots.take_last_released();
            }
            if let Err(e) = self.release_to_runtime(index) {
                log::warn!("[SWAPCHAIN] Releasing image {} of {:?} failed: {}", index, self.handle, e);
            }
        }
        for index in discarded {
            if let Err(e) = self.release_to_runtime(index) {
                log::warn!(
                    "[SWAPCHAIN] Releasing discarded image {} of {:?} failed: {}",
                    index,
                    self.handle,
                    e
                );
            }
        }
    }
}

impl Swapchain for SubmittableSwapchain {
    fn acquire_image(&self, wait: bool) -> LayerResult<u32> {
        // Re-acquiring the deferred image hands it back to the runtime first.
        let next = self.slots.peek_next();
        let superseded = {
            let mut pending = self.pending.lock();
            if *pending == Some(next) {
                pending.take()
            } else {
                None
            }
        };
        if let Some(index) = superseded {
            log::debug!("[SWAPCHAIN] Image {} re-acquired before commit", index);
            self.release_to_runtime(index)?;
        }

        let index = self.slots.acquire(wait)?;
        let runtime_index = match self.runtime.acquire_swapchain_image(self.handle) {
            Ok(runtime_index) => runtime_index,
            Err(e) => {
                self.slots.abandon(index);
                return Err(e);
            },
        };

        let acquired = (|| {
            if runtime_index != index {
                return Err(LayerError::Other(format!(
                    "runtime acquired image {} out of ring order (expected {})",
                    runtime_index, index
                )));
            }
            if wait {
                self.slots.wait()?;
                self.runtime.wait_swapchain_image(self.handle)?;
            }
            self.fences.application_to_composition()?;
            Ok(index)
        })();

        if let Err(e) = &acquired {
            // The runtime already handed the image out, so the ring moves on.
            log::warn!(
                "[SWAPCHAIN] Acquire of image {} of {:?} failed: {}",
                index,
                self.handle,
                e
            );
            self.slots.discard(index);
            self.release_discarded();
        }
        acquired
    }

    fn wait_image(&self) -> LayerResult<()> {
        self.slots.wait()?;
        self.runtime.wait_swapchain_image(self.handle)
    }

    fn release_image(&self) -> LayerResult<()> {
        let index = self.slots.release()?;
        if !self.defers_release() {
            self.release_to_runtime(index)?;
            self.release_discarded();
            return Ok(());
        }

        let older = self.pending.lock().replace(index);
        if let Some(older) = older {
            // The runtime releases in order, so the older image goes first.
            self.release_to_runtime(older)?;
        }
        self.release_discarded();
        Ok(())
    }

    fn last_released_image(&self) -> LayerResult<Option<Arc<SwapchainImage>>> {
        if !self.mode.contains(SwapchainMode::READ) {
            return Err(LayerError::InvalidCallOrder(format!(
                "swapchain {:?} is not readable",
                self.handle
            )));
        }

        let Some(index) = *self.pending.lock() else {
            return Ok(None);
        };
        let image = self.image(index)?;
        if let Some(bounce) = &self.bounce {
            self.application_device
                .copy_texture(image.application_texture().as_ref(), bounce.application.as_ref())?;
        }
        self.fences.application_to_composition()?;
        Ok(Some(image))
    }

    fn commit_last_released_image(&self) -> LayerResult<()> {
        if !self.defers_release() {
            return Err(LayerError::InvalidCallOrder(format!(
                "swapchain {:?} is neither readable nor writable",
                self.handle
            )));
        }

        let Some(index) = self.pending.lock().take() else {
            return Ok(());
        };
        self.slots.take_last_released();

        self.fences.composition_to_application()?;
        if self.mode.contains(SwapchainMode::WRITE) {
            if let Some(bounce) = &self.bounce {
                let image = self.image(index)?;
                self.application_device
                    .copy_texture(bounce.application.as_ref(), image.application_texture().as_ref())?;
            }
        }
        self.release_to_runtime(index)
    }

    fn image(&self, index: u32) -> LayerResult<Arc<SwapchainImage>> {
        self.images
            .get(index as usize)
            .cloned()
            .ok_or_else(|| LayerError::NotFound(format!("image {} of swapchain {:?}", index, self.handle)))
    }

    fn len(&self) -> u32 {
        self.images.len() as u32
    }

    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn application_format(&self) -> i64 {
        self.application_format
    }

    fn mode(&self) -> SwapchainMode {
        self.mode
    }

    fn handle(&self) -> LayerResult<xr::Swapchain> {
        Ok(self.handle)
    }
}

impl Drop for SubmittableSwapchain {
    fn drop(&mut self) {
        self.fences.drain();
        if self.owned {
            if let Err(e) = self.runtime.destroy_swapchain(self.handle) {
                log::warn!("[SWAPCHAIN] Destroying runtime swapchain {:?} failed: {}", self.handle, e);
            }
        }
        log::debug!("[SWAPCHAIN] Swapchain {:?} dropped", self.handle);
    }
}
