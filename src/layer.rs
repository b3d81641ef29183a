//! Quad-view composition of a session's projection layer.
//!
//! Each eye's peripheral and focus views are projected into one full-FOV
//! image per eye, rendered into a runtime swapchain owned by the layer and
//! submitted in place of the application's four views.

use std::sync::Arc;

use bitflags::bitflags;
use glam::Vec3;
use openxr_sys as xr;

use crate::composition::CompositionFramework;
use crate::config::LayerSettings;
use crate::error::{LayerError, LayerResult};
use crate::graphics::{GenericFormat, GraphicsTexture, TextureDesc, TextureUsage};
use crate::projection::foveation::{Eye, Foveation};
use crate::projection::{
    focus_resolution, BlendOptions, Fov, Pose, ProjectionParams, QuadViewRenderer, Rect, ViewSource,
};
use crate::swapchain::{Swapchain, SwapchainImage, SwapchainMode};

bitflags! {
    /// Composition layer flags, bit-compatible with `XrCompositionLayerFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerFlags: u64 {
        const CORRECT_CHROMATIC_ABERRATION = 0x1;
        const BLEND_TEXTURE_SOURCE_ALPHA = 0x2;
        const UNPREMULTIPLIED_ALPHA = 0x4;
    }
}

impl From<xr::CompositionLayerFlags> for LayerFlags {
    fn from(flags: xr::CompositionLayerFlags) -> Self {
        LayerFlags::from_bits_truncate(flags.into_raw())
    }
}

/// One submitted view: where its pixels are and how it was rendered.
#[derive(Clone)]
pub struct ViewInput {
    pub swapchain: Arc<dyn Swapchain>,
    pub rect: Rect,
    pub layer: u32,
    pub fov: Fov,
    pub pose: Pose,
}

impl ViewInput {
    pub fn from_projection_view(view: &xr::CompositionLayerProjectionView, swapchain: Arc<dyn Swapchain>) -> Self {
        let rect = view.sub_image.image_rect;
        Self {
            swapchain,
            rect: Rect::new(
                rect.offset.x,
                rect.offset.y,
                rect.extent.width.max(0) as u32,
                rect.extent.height.max(0) as u32,
            ),
            layer: view.sub_image.image_array_index,
            fov: view.fov.into(),
            pose: view.pose.into(),
        }
    }

    fn released_image(&self, role: &str) -> LayerResult<Arc<SwapchainImage>> {
        self.swapchain
            .last_released_image()?
            .ok_or_else(|| LayerError::InvalidCallOrder(format!("{} swapchain has no released image", role)))
    }
}

/// Output resolution of the composited stereo views.
pub fn output_resolution(settings: &LayerSettings, recommended: (u32, u32), max: (u32, u32)) -> (u32, u32) {
    focus_resolution(recommended, max, settings.focus_multiplier)
}

/// Composites quad views into stereo views for one session.
pub struct QuadViewCompositor {
    framework: Arc<CompositionFramework>,
    renderer: Box<dyn QuadViewRenderer>,
    outputs: [Arc<dyn Swapchain>; 2],
    /// Per-eye sharpened copy of the focus view, sized to its rectangle.
    sharpened: [Option<Arc<dyn GraphicsTexture>>; 2],
}

impl QuadViewCompositor {
    /// `format` is an application-device format code.
    pub fn new(framework: Arc<CompositionFramework>, format: i64, resolution: (u32, u32)) -> LayerResult<Self> {
        let desc = TextureDesc::color(resolution.0, resolution.1, format)
            .with_usage(TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED);
        let mode = SwapchainMode::SUBMIT | SwapchainMode::WRITE;
        let outputs = [
            framework.create_swapchain(&desc, mode)?,
            framework.create_swapchain(&desc, mode)?,
        ];
        let renderer = framework.create_projection_renderer()?;

        log::info!(
            "[LAYER] Quad view output {}x{} format {} ({} renderer)",
            resolution.0,
            resolution.1,
            format,
            renderer.api()
        );

        Ok(Self {
            framework,
            renderer,
            outputs,
            sharpened: [None, None],
        })
    }

    pub fn output(&self, eye: Eye) -> &Arc<dyn Swapchain> {
        &self.outputs[eye.index()]
    }

    /// Blend options for a submitted layer.
    ///
    /// The layer's "unpremultiplied alpha" flag overrides the session default.
    /// Without "blend texture source alpha" the focus layer is opaque.
    pub fn blend_options(&self, flags: LayerFlags) -> BlendOptions {
        let mut blend = BlendOptions::from_settings(self.framework.settings());
        if flags.contains(LayerFlags::UNPREMULTIPLIED_ALPHA) {
            blend.unpremultiplied_alpha = true;
        }
        blend.ignore_alpha = !flags.contains(LayerFlags::BLEND_TEXTURE_SOURCE_ALPHA);
        blend
    }

    /// Field of view for an eye's focus view.
    ///
    /// Follows `gaze` (a view-space direction) when eye tracking is enabled,
    /// otherwise uses the fixed placement.
    pub fn focus_fov(&self, eye: Eye, eye_pose: Pose, peripheral_fov: Fov, gaze: Option<Vec3>) -> LayerResult<Fov> {
        let settings = self.framework.settings();
        let foveation = Foveation::new(eye, eye_pose, peripheral_fov)?;
        Ok(match gaze {
            Some(direction) if settings.use_eye_tracking() => foveation.gaze(direction, settings),
            _ => foveation.fixed(settings),
        })
    }

    /// Intermediate texture for an eye's sharpened focus view, recreated when
    /// the focus rectangle changes size.
    fn sharpen_target(&mut self, eye: Eye, width: u32, height: u32) -> LayerResult<Arc<dyn GraphicsTexture>> {
        let slot = &mut self.sharpened[eye.index()];
        if let Some(texture) = slot.as_ref() {
            let desc = texture.desc();
            if desc.width == width && desc.height == height {
                return Ok(texture.clone());
            }
        }

        let device = self.framework.composition_device();
        let desc = TextureDesc::color(width, height, device.translate_from_generic(GenericFormat::R16G16B16A16Float));
        let texture = device.create_texture(&desc, false)?;
        log::debug!("[LAYER] Sharpening target for {:?} eye: {}x{}", eye, width, height);
        *slot = Some(texture.clone());
        Ok(texture)
    }

    /// Composite one eye and return the view to submit in its place.
    ///
    /// Reads the last released images of both inputs, renders into the eye's
    /// output swapchain and hands all three back to the runtime.
    pub fn composite_view(
        &mut self,
        eye: Eye,
        peripheral: &ViewInput,
        focus: &ViewInput,
        flags: LayerFlags,
    ) -> LayerResult<xr::CompositionLayerProjectionView> {
        let params = ProjectionParams::new(
            &peripheral.fov,
            &peripheral.pose,
            &focus.fov,
            &focus.pose,
            self.blend_options(flags),
        )?;

        let framework = Arc::clone(&self.framework);
        let scope = framework.begin_composition()?;

        let peripheral_image = peripheral.released_image("peripheral")?;
        let focus_image = focus.released_image("focus")?;

        let sharpness = self.framework.settings().sharpen_focus_view;
        let sharpened = if sharpness > 0.0 {
            let texture = self.sharpen_target(eye, focus.rect.width, focus.rect.height)?;
            let full = Rect::full(texture.as_ref());
            self.renderer.sharpen(
                ViewSource::new(focus_image.read_texture().as_ref(), focus.rect, focus.layer),
                ViewSource::new(texture.as_ref(), full, 0),
                sharpness,
            )?;
            Some((texture, full))
        } else {
            None
        };
        let focus_source = match &sharpened {
            Some((texture, full)) => ViewSource::new(texture.as_ref(), *full, 0),
            None => ViewSource::new(focus_image.read_texture().as_ref(), focus.rect, focus.layer),
        };

        let output = &self.outputs[eye.index()];
        let index = output.acquire_image(true)?;
        let target = output.image(index)?;
        let rendered = self.renderer.render(
            ViewSource::new(peripheral_image.read_texture().as_ref(), peripheral.rect, peripheral.layer),
            focus_source,
            ViewSource::new(
                target.write_texture().as_ref(),
                Rect::full(target.write_texture().as_ref()),
                0,
            ),
            &params,
        );
        // Keep the output ring consistent even when rendering failed.
        output.release_image()?;
        rendered?;
        output.commit_last_released_image()?;

        peripheral.swapchain.commit_last_released_image()?;
        focus.swapchain.commit_last_released_image()?;
        scope.finish()?;

        log::trace!("[LAYER] Composited {:?} eye into image {}", eye, index);
        Ok(xr::CompositionLayerProjectionView {
            ty: xr::CompositionLayerProjectionView::TYPE,
            next: std::ptr::null(),
            pose: peripheral.pose.into(),
            fov: peripheral.fov.into(),
            sub_image: output.sub_image()?,
        })
    }
}
