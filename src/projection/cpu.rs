//! CPU reference renderer for the software device.

use std::sync::Arc;

use glam::{Vec2, Vec4};

use super::shading;
use super::{check_sharpen, ProjectionParams, QuadViewRenderer, Rect, ViewSource};
use crate::error::LayerResult;
use crate::graphics::software::SoftwareQueue;
use crate::graphics::{downcast_texture, GraphicsApi, SoftwareTexture};

/// One layer of a source texture, read once per pass.
struct SourceImage {
    texels: Vec<[f32; 4]>,
    width: u32,
    height: u32,
    rect: Rect,
}

impl SourceImage {
    fn read(source: &ViewSource<'_>) -> LayerResult<Self> {
        let texture = downcast_texture::<SoftwareTexture>(source.texture, GraphicsApi::Software)?;
        Ok(Self {
            texels: texture.read_layer(source.layer)?,
            width: texture.width(),
            height: texture.height(),
            rect: source.rect,
        })
    }

    fn texel(&self, x: i64, y: i64) -> Vec4 {
        // Clamp to the image rectangle.
        let x = x.clamp(self.rect.x as i64, (self.rect.x as i64 + self.rect.width as i64 - 1).max(0));
        let y = y.clamp(self.rect.y as i64, (self.rect.y as i64 + self.rect.height as i64 - 1).max(0));
        let x = x.min(self.width as i64 - 1) as usize;
        let y = y.min(self.height as i64 - 1) as usize;
        Vec4::from_array(self.texels[y * self.width as usize + x])
    }

    /// Bilinear sample at a coordinate normalized to the image rectangle.
    fn sample(&self, uv: Vec2) -> Vec4 {
        let px = self.rect.x as f32 + uv.x * self.rect.width as f32 - 0.5;
        let py = self.rect.y as f32 + uv.y * self.rect.height as f32 - 0.5;
        let x0 = px.floor();
        let y0 = py.floor();
        let fx = px - x0;
        let fy = py - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let top = self.texel(x0, y0).lerp(self.texel(x0 + 1, y0), fx);
        let bottom = self.texel(x0, y0 + 1).lerp(self.texel(x0 + 1, y0 + 1), fx);
        top.lerp(bottom, fy)
    }
}

/// Runs the projection pass pixel by pixel on the calling thread.
pub struct CpuRenderer {
    queue: Arc<SoftwareQueue>,
}

impl CpuRenderer {
    pub fn new(queue: Arc<SoftwareQueue>) -> Self {
        Self { queue }
    }
}

impl QuadViewRenderer for CpuRenderer {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Software
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
        let target = downcast_texture::<SoftwareTexture>(output.texture, GraphicsApi::Software)?;

        self.queue.begin()?;

        let peripheral_image = SourceImage::read(&peripheral)?;
        let focus_image = SourceImage::read(&focus)?;

        let rect = output.rect;
        let mut pixels = target.read_layer(output.layer)?;
        let width = target.width() as usize;
        for y in 0..rect.height {
            for x in 0..rect.width {
                let uv = Vec2::new(
                    (x as f32 + 0.5) / rect.width as f32,
                    (y as f32 + 0.5) / rect.height as f32,
                );
                let color = shading::composite(
                    uv,
                    peripheral_image.sample(uv),
                    &params.focus_matrix,
                    |t| focus_image.sample(t),
                    &params.blend,
                );
                let index = (rect.y as usize + y as usize) * width + rect.x as usize + x as usize;
                pixels[index] = color.to_array();
            }
        }
        target.write_layer(output.layer, &pixels)?;

        log::trace!(
            "[PROJECTION] CPU pass wrote {}x{} pixels into layer {}",
            rect.width,
            rect.height,
            output.layer
        );
        Ok(())
    }

    fn sharpen(&mut self, source: ViewSource<'_>, output: ViewSource<'_>, sharpness: f32) -> LayerResult<()> {
        check_sharpen(&source, &output)?;
        let target = downcast_texture::<SoftwareTexture>(output.texture, GraphicsApi::Software)?;

        self.queue.begin()?;

        let image = SourceImage::read(&source)?;
        let peak = shading::sharpen_peak(sharpness);
        let rect = output.rect;
        let mut pixels = target.read_layer(output.layer)?;
        let width = target.width() as usize;
        for y in 0..rect.height as i64 {
            for x in 0..rect.width as i64 {
                let (sx, sy) = (source.rect.x as i64 + x, source.rect.y as i64 + y);
                let color = shading::sharpen(
                    image.texel(sx, sy - 1),
                    image.texel(sx - 1, sy),
                    image.texel(sx, sy),
                    image.texel(sx + 1, sy),
                    image.texel(sx, sy + 1),
                    peak,
                );
                let index = (rect.y as i64 + y) as usize * width + (rect.x as i64 + x) as usize;
                pixels[index] = color.to_array();
            }
        }
        target.write_layer(output.layer, &pixels)?;
        Ok(())
    }
}
