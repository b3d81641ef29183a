//! Quad-view to stereo projection.
//!
//! Each output eye is the peripheral view with the focus view re-projected on
//! top of it. The focus view is placed with a single matrix taking peripheral
//! NDC to focus NDC; its edges fade out over a configurable band.
//!
//! - [`view`]: FOV, pose and projection matrix math
//! - [`foveation`]: where the focus view goes (fixed or gaze-driven)
//! - [`shading`]: per-pixel blending shared by every renderer
//! - [`cpu`] / [`gpu`]: the renderers behind [`QuadViewRenderer`]

pub mod cpu;
pub mod foveation;
pub mod gpu;
pub mod shading;
pub mod view;


use glam::Mat4;

use crate::config::LayerSettings;
use crate::error::{LayerError, LayerResult};
use crate::graphics::{GraphicsApi, GraphicsTexture};

pub use view::{projection_matrix, Fov, Pose, FAR_PLANE, NEAR_PLANE};

/// Rectangle within a texture, in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whole texture.
    pub fn full(texture: &dyn GraphicsTexture) -> Self {
        let desc = texture.desc();
        Self::new(0, 0, desc.width, desc.height)
    }

    /// Offset and scale of this rectangle in normalized texture coordinates.
    pub fn uv_transform(&self, texture_width: u32, texture_height: u32) -> [f32; 4] {
        [
            self.x as f32 / texture_width as f32,
            self.y as f32 / texture_height as f32,
            self.width as f32 / texture_width as f32,
            self.height as f32 / texture_height as f32,
        ]
    }

    fn check(&self, texture: &dyn GraphicsTexture) -> LayerResult<()> {
        let desc = texture.desc();
        let fits = self.x >= 0
            && self.y >= 0
            && self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= desc.width as u64
            && self.y as u64 + self.height as u64 <= desc.height as u64;
        if !fits {
            return Err(LayerError::Configuration(format!(
                "image rect {:?} outside {}x{} texture",
                self, desc.width, desc.height
            )));
        }
        Ok(())
    }
}

/// One image taking part in a projection pass.
#[derive(Clone, Copy)]
pub struct ViewSource<'a> {
    pub texture: &'a dyn GraphicsTexture,
    pub rect: Rect,
    pub layer: u32,
}

impl<'a> ViewSource<'a> {
    pub fn new(texture: &'a dyn GraphicsTexture, rect: Rect, layer: u32) -> Self {
        Self { texture, rect, layer }
    }

    /// Validate the rectangle and array layer against the texture.
    pub fn check(&self) -> LayerResult<()> {
        self.rect.check(self.texture)?;
        if self.layer >= self.texture.desc().array_size {
            return Err(LayerError::Configuration(format!(
                "array layer {} outside {}-layer texture",
                self.layer,
                self.texture.desc().array_size
            )));
        }
        Ok(())
    }
}

/// Blending configuration of a composition pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendOptions {
    /// Width of the edge fade in focus texture space, 0 for a hard edge.
    pub smoothing: f32,
    /// Distance from every edge beyond which alpha is floored at 0.5.
    pub floor_margin: f32,
    /// Sources hold straight (non-premultiplied) color.
    pub unpremultiplied_alpha: bool,
    /// Treat sources as opaque.
    pub ignore_alpha: bool,
    /// Output the focus layer alone.
    pub debug_focus_view: bool,
}

impl Default for BlendOptions {
    fn default() -> Self {
        Self {
            smoothing: 0.0,
            floor_margin: 0.0,
            unpremultiplied_alpha: false,
            ignore_alpha: false,
            debug_focus_view: false,
        }
    }
}

impl BlendOptions {
    pub fn from_settings(settings: &LayerSettings) -> Self {
        Self {
            smoothing: settings.smoothen_focus_view_edges,
            floor_margin: settings.smoothing_floor_margin,
            unpremultiplied_alpha: !settings.premultiplied_alpha,
            ignore_alpha: false,
            debug_focus_view: settings.debug_focus_view,
        }
    }
}

/// Validated inputs of one projection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionParams {
    /// Peripheral NDC to focus clip space.
    pub focus_matrix: Mat4,
    pub blend: BlendOptions,
}

impl ProjectionParams {
    /// Build the focus matrix for a focus view seen from a peripheral view.
    ///
    /// Fails with a configuration error for a zero or non-finite field of
    /// view and for a matrix that cannot be inverted.
    pub fn new(
        peripheral_fov: &Fov,
        peripheral_pose: &Pose,
        focus_fov: &Fov,
        focus_pose: &Pose,
        blend: BlendOptions,
    ) -> LayerResult<Self> {
        peripheral_fov.check()?;
        focus_fov.check()?;

        let peripheral_projection = projection_matrix(peripheral_fov, NEAR_PLANE, FAR_PLANE);
        let focus_projection = projection_matrix(focus_fov, NEAR_PLANE, FAR_PLANE);
        let focus_from_peripheral = focus_pose.relative_to(peripheral_pose).inverse().to_mat4();

        let focus_matrix = focus_projection * focus_from_peripheral * peripheral_projection.inverse();
        let det = focus_matrix.determinant() as f64;
        if !focus_matrix.is_finite() || !det.is_finite() || det.abs() < 1e-12 {
            return Err(LayerError::Configuration(format!(
                "degenerate focus projection (det {})",
                det
            )));
        }

        let mut blend = blend;
        blend.smoothing = blend.smoothing.clamp(0.0, 0.5);
        blend.floor_margin = blend.floor_margin.clamp(0.0, 0.5);

        Ok(Self { focus_matrix, blend })
    }
}

/// A device-specific implementation of the projection pass.
pub trait QuadViewRenderer: Send {
    fn api(&self) -> GraphicsApi;

    /// Render `peripheral` with `focus` composited on top into `output`.
    ///
    /// All three textures must belong to the renderer's device.
    fn render(
        &mut self,
        peripheral: ViewSource<'_>,
        focus: ViewSource<'_>,
        output: ViewSource<'_>,
        params: &ProjectionParams,
    ) -> LayerResult<()>;

    /// Sharpen `source` texel for texel into `output`.
    ///
    /// Both rectangles must have the same size. `sharpness` is clamped to 0..1.
    fn sharpen(&mut self, source: ViewSource<'_>, output: ViewSource<'_>, sharpness: f32) -> LayerResult<()>;
}

/// Validate a sharpening pass: both views in range and the same size.
pub fn check_sharpen(source: &ViewSource<'_>, output: &ViewSource<'_>) -> LayerResult<()> {
    source.check()?;
    output.check()?;
    if source.rect.width != output.rect.width || source.rect.height != output.rect.height {
        return Err(LayerError::Configuration(format!(
            "sharpening {}x{} into {}x{}",
            source.rect.width, source.rect.height, output.rect.width, output.rect.height
        )));
    }
    if output.texture.desc().sample_count != 1 {
        return Err(LayerError::Configuration(
            "sharpening output must be single-sampled".to_string(),
        ));
    }
    Ok(())
}

/// Uniform block of the sharpening pass, shared by the WGSL and HLSL pipelines.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SharpenUniforms {
    pub source_rect: [i32; 4], // x, y, width, height (texels)
    pub output_origin: [i32; 2],
    pub peak: f32,
    pub _pad: f32,
}

impl SharpenUniforms {
    pub fn new(source: &ViewSource<'_>, output: &ViewSource<'_>, sharpness: f32) -> Self {
        Self {
            source_rect: [
                source.rect.x,
                source.rect.y,
                source.rect.width as i32,
                source.rect.height as i32,
            ],
            output_origin: [output.rect.x, output.rect.y],
            peak: shading::sharpen_peak(sharpness),
            _pad: 0.0,
        }
    }
}

/// Uniform block shared by the WGSL and HLSL pipelines.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ProjectionUniforms {
    pub focus_matrix: [[f32; 4]; 4],
    pub peripheral_rect: [f32; 4], // u, v, width, height (normalized)
    pub focus_rect: [f32; 4],      // u, v, width, height (normalized)
    pub smoothing: [f32; 4],       // width, floor_margin, 0, 0
    pub flags: [f32; 4],           // unpremultiplied, ignore_alpha, debug, 0
}

impl ProjectionUniforms {
    pub fn new(peripheral: &ViewSource<'_>, focus: &ViewSource<'_>, params: &ProjectionParams) -> Self {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let pdesc = peripheral.texture.desc();
        let fdesc = focus.texture.desc();
        Self {
            focus_matrix: params.focus_matrix.to_cols_array_2d(),
            peripheral_rect: peripheral.rect.uv_transform(pdesc.width, pdesc.height),
            focus_rect: focus.rect.uv_transform(fdesc.width, fdesc.height),
            smoothing: [params.blend.smoothing, params.blend.floor_margin, 0.0, 0.0],
            flags: [
                flag(params.blend.unpremultiplied_alpha),
                flag(params.blend.ignore_alpha),
                flag(params.blend.debug_focus_view),
                0.0,
            ],
        }
    }
}

/// Full-FOV output resolution for a focus multiplier.
///
/// Width scales the recommended width, height keeps the recommended aspect
/// ratio, both clamped to the runtime maximum.
pub fn focus_resolution(recommended: (u32, u32), max: (u32, u32), multiplier: f32) -> (u32, u32) {
    let (rw, rh) = recommended;
    let width = (rw as f32 * multiplier).round().max(1.0);
    let height = (width * rh as f32 / rw.max(1) as f32).round().max(1.0);
    ((width as u32).min(max.0), (height as u32).min(max.1))
}
