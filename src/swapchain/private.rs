//! Composition-only swapchain.

use std::sync::Arc;

use openxr_sys as xr;

use super::{FencePair, SlotTable, Swapchain, SwapchainImage, SwapchainMode};
use crate::error::{LayerError, LayerResult};
use crate::graphics::{GraphicsDevice, TextureDesc};

/// Swapchain whose images the layer allocates itself.
///
/// Textures are created shareable on the composition device and opened on
/// the application device. There is no runtime handle.
pub struct PrivateSwapchain {
    mode: SwapchainMode,
    desc: TextureDesc,
    application_format: i64,
    images: Vec<Arc<SwapchainImage>>,
    fences: FencePair,
    slots: SlotTable,
}

impl PrivateSwapchain {
    /// `desc` is given in composition-device formats.
    pub fn new(
        application_device: &dyn GraphicsDevice,
        composition_device: &dyn GraphicsDevice,
        desc: &TextureDesc,
        mode: SwapchainMode,
        depth: u32,
    ) -> LayerResult<Self> {
        desc.check()?;
        if depth == 0 {
            return Err(LayerError::Configuration("private swapchain depth is zero".to_string()));
        }

        let application_desc = desc.translated(composition_device, application_device);
        let images = (0..depth)
            .map(|index| {
                let composition = composition_device.create_texture(desc, true)?;
                let handle = composition.shareable_handle().ok_or_else(|| {
                    LayerError::Import("private swapchain texture is not shareable".to_string())
                })?;
                let application = application_device.open_texture(&handle, &application_desc)?;
                Ok(Arc::new(SwapchainImage::new(
                    index,
                    application,
                    composition.clone(),
                    composition,
                )))
            })
            .collect::<LayerResult<Vec<_>>>()?;

        let fences = FencePair::new(application_device, composition_device)?;

        log::info!(
            "[SWAPCHAIN] Private swapchain: {} images {}x{} format {} mode {:?}",
            depth,
            desc.width,
            desc.height,
            desc.format,
            mode
        );

        Ok(Self {
            mode,
            desc: *desc,
            application_format: application_desc.format,
            images,
            fences,
            slots: SlotTable::new("private swapchain", depth),
        })
    }
}

impl Swapchain for PrivateSwapchain {
    fn acquire_image(&self, wait: bool) -> LayerResult<u32> {
        let index = self.slots.acquire(wait)?;
        if wait {
            self.slots.wait()?;
        }
        Ok(index)
    }

    fn wait_image(&self) -> LayerResult<()> {
        self.slots.wait().map(|_| ())
    }

    fn release_image(&self) -> LayerResult<()> {
        self.slots.release().map(|_| ())
    }

    fn last_released_image(&self) -> LayerResult<Option<Arc<SwapchainImage>>> {
        if !self.mode.contains(SwapchainMode::READ) {
            return Err(LayerError::InvalidCallOrder("private swapchain is not readable".to_string()));
        }
        let Some(index) = self.slots.last_released() else {
            return Ok(None);
        };
        self.fences.application_to_composition()?;
        self.image(index).map(Some)
    }

    fn commit_last_released_image(&self) -> LayerResult<()> {
        if !self.mode.intersects(SwapchainMode::READ | SwapchainMode::WRITE) {
            return Err(LayerError::InvalidCallOrder(
                "private swapchain is neither readable nor writable".to_string(),
            ));
        }
        if self.slots.take_last_released().is_some() {
            self.fences.composition_to_application()?;
        }
        Ok(())
    }

    fn image(&self, index: u32) -> LayerResult<Arc<SwapchainImage>> {
        self.images
            .get(index as usize)
            .cloned()
            .ok_or_else(|| LayerError::NotFound(format!("image {} of private swapchain", index)))
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
        Err(LayerError::InvalidCallOrder("private swapchains have no runtime handle".to_string()))
    }
}

impl Drop for PrivateSwapchain {
    fn drop(&mut self) {
        self.fences.drain();
    }
}
