//! Per-pixel composition math.
//!
//! The CPU renderer calls these directly; the WGSL and HLSL shaders are
//! line-for-line ports and the tests hold them to the same results.

use glam::{Mat4, Vec2, Vec4};

use super::BlendOptions;

/// Floor applied to the edge fade away from the focus borders.
pub const ALPHA_FLOOR: f32 = 0.5;

pub fn premultiply(c: Vec4) -> Vec4 {
    Vec4::new(c.x * c.w, c.y * c.w, c.z * c.w, c.w)
}

/// Inverse of [`premultiply`]. Alpha 0 yields transparent black.
pub fn unpremultiply(c: Vec4) -> Vec4 {
    if c.w <= 0.0 {
        return Vec4::ZERO;
    }
    Vec4::new(c.x / c.w, c.y / c.w, c.z / c.w, c.w)
}

/// Bring a sampled color to premultiplied form.
pub fn to_premultiplied(c: Vec4, unpremultiplied_input: bool, ignore_alpha: bool) -> Vec4 {
    if ignore_alpha {
        let straight = if unpremultiplied_input { c } else { unpremultiply(c) };
        straight.truncate().extend(1.0)
    } else if unpremultiplied_input {
        premultiply(c)
    } else {
        c
    }
}

/// Output pixel coordinate (0..1, +V down) to peripheral NDC (+Y up).
pub fn uv_to_ndc(uv: Vec2) -> Vec2 {
    Vec2::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0)
}

pub fn ndc_to_uv(ndc: Vec2) -> Vec2 {
    ndc * Vec2::new(0.5, -0.5) + Vec2::splat(0.5)
}

/// Where an output pixel lands in the focus texture, if inside the focus view.
pub fn focus_uv(focus_matrix: &Mat4, uv: Vec2) -> Option<Vec2> {
    let ndc = uv_to_ndc(uv);
    let clip = *focus_matrix * Vec4::new(ndc.x, ndc.y, 1.0, 1.0);
    if clip.w <= 0.0 {
        return None;
    }
    let focus_ndc = Vec2::new(clip.x, clip.y) / clip.w;
    if focus_ndc.x.abs() > 1.0 || focus_ndc.y.abs() > 1.0 {
        return None;
    }
    Some(ndc_to_uv(focus_ndc))
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Opacity of the focus layer at a focus texture coordinate.
pub fn edge_alpha(t: Vec2, smoothing: f32, floor_margin: f32) -> f32 {
    let inside = (0.0..=1.0).contains(&t.x) && (0.0..=1.0).contains(&t.y);
    if smoothing <= 0.0 {
        return if inside { 1.0 } else { 0.0 };
    }

    let falloff = |v: f32| smoothstep(0.0, smoothing, v) * (1.0 - smoothstep(1.0 - smoothing, 1.0, v));
    let alpha = falloff(t.x) * falloff(t.y);

    let edge_distance = t.x.min(t.y).min(1.0 - t.x).min(1.0 - t.y);
    if edge_distance >= floor_margin {
        alpha.max(ALPHA_FLOOR)
    } else {
        alpha
    }
}

/// Composite one pixel.
///
/// `sample_focus` is only called for pixels inside the focus view.
pub fn composite(
    uv: Vec2,
    peripheral: Vec4,
    focus_matrix: &Mat4,
    sample_focus: impl FnOnce(Vec2) -> Vec4,
    blend: &BlendOptions,
) -> Vec4 {
    let peripheral = to_premultiplied(peripheral, blend.unpremultiplied_alpha, blend.ignore_alpha);
    let focus = match focus_uv(focus_matrix, uv) {
        Some(t) => {
            let sample = to_premultiplied(sample_focus(t), blend.unpremultiplied_alpha, blend.ignore_alpha);
            sample * edge_alpha(t, blend.smoothing, blend.floor_margin)
        },
        None => Vec4::ZERO,
    };

    if blend.debug_focus_view {
        return focus.truncate().extend(1.0);
    }
    (focus.truncate() + peripheral.truncate() * (1.0 - focus.w)).extend(1.0)
}

/// Negative lobe weight of the sharpening filter for a strength in 0..1.
pub fn sharpen_peak(sharpness: f32) -> f32 {
    let sharpness = sharpness.clamp(0.0, 1.0);
    -1.0 / (8.0 + (5.0 - 8.0) * sharpness)
}

fn sharpen_channel(b: f32, d: f32, e: f32, f: f32, h: f32, peak: f32) -> f32 {
    let mn = b.min(d).min(e).min(f).min(h);
    let mx = b.max(d).max(e).max(f).max(h);
    if mx <= 0.0 {
        return e.clamp(0.0, 1.0);
    }
    // Headroom left before the signal limits, shaped by a square root.
    let amp = (mn.min(1.0 - mx) / mx).clamp(0.0, 1.0).sqrt();
    let w = amp * peak;
    ((b * w + d * w + f * w + h * w + e) / (1.0 + 4.0 * w)).clamp(0.0, 1.0)
}

/// Contrast-adaptive sharpening of the center texel `e` of a cross.
///
/// ```text
///   b
/// d e f
///   h
/// ```
///
/// Color channels are sharpened independently; alpha is kept.
pub fn sharpen(b: Vec4, d: Vec4, e: Vec4, f: Vec4, h: Vec4, peak: f32) -> Vec4 {
    Vec4::new(
        sharpen_channel(b.x, d.x, e.x, f.x, h.x, peak),
        sharpen_channel(b.y, d.y, e.y, f.y, h.y, peak),
        sharpen_channel(b.z, d.z, e.z, f.z, h.z, peak),
        e.w,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharpen_peak_range() {
        assert!((sharpen_peak(0.0) + 0.125).abs() < 1e-6);
        assert!((sharpen_peak(1.0) + 0.2).abs() < 1e-6);
        assert_eq!(sharpen_peak(3.0), sharpen_peak(1.0));
    }

    #[test]
    fn test_sharpen_keeps_flat_regions() {
        let c = Vec4::new(0.25, 0.5, 0.75, 0.6);
        let out = sharpen(c, c, c, c, c, sharpen_peak(1.0));
        assert!(out.abs_diff_eq(c, 1e-5));
        assert_eq!(sharpen(Vec4::ZERO, Vec4::ZERO, Vec4::ZERO, Vec4::ZERO, Vec4::ZERO, -0.2), Vec4::ZERO);
    }

    #[test]
    fn test_sharpen_raises_local_contrast() {
        let dark = Vec4::new(0.3, 0.3, 0.3, 1.0);
        let bright = Vec4::new(0.5, 0.5, 0.5, 1.0);
        let out = sharpen(dark, dark, bright, dark, dark, sharpen_peak(0.7));
        assert!(out.x > bright.x);
        assert!(out.x <= 1.0);
        assert_eq!(out.w, 1.0);
    }

    #[test]
    fn test_premultiply_roundtrip() {
        for alpha in [0.05f32, 0.25, 0.5, 0.75, 1.0] {
            for value in [0.0f32, 0.1, 0.5, 0.9, 1.0] {
                let c = Vec4::new(value, 1.0 - value, value * 0.5, alpha);
                let back = premultiply(unpremultiply(premultiply(c)));
                assert!(back.abs_diff_eq(premultiply(c), 1e-6));
                assert!(unpremultiply(premultiply(c)).abs_diff_eq(c, 1e-5));
            }
        }
    }

    #[test]
    fn test_unpremultiply_zero_alpha_is_transparent_black() {
        let c = unpremultiply(Vec4::new(0.3, 0.2, 0.1, 0.0));
        assert_eq!(c, Vec4::ZERO);
        assert!(c.is_finite());
    }

    #[test]
    fn test_to_premultiplied_modes() {
        let straight = Vec4::new(1.0, 0.5, 0.0, 0.5);
        assert_eq!(to_premultiplied(straight, true, false), Vec4::new(0.5, 0.25, 0.0, 0.5));
        assert_eq!(to_premultiplied(straight, false, false), straight);
        assert_eq!(to_premultiplied(straight, true, true), Vec4::new(1.0, 0.5, 0.0, 1.0));
        assert_eq!(
            to_premultiplied(Vec4::new(0.5, 0.25, 0.0, 0.5), false, true),
            Vec4::new(1.0, 0.5, 0.0, 1.0)
        );
    }

    #[test]
    fn test_ndc_uv_mapping() {
        assert_eq!(uv_to_ndc(Vec2::new(0.0, 0.0)), Vec2::new(-1.0, 1.0));
        assert_eq!(uv_to_ndc(Vec2::new(1.0, 1.0)), Vec2::new(1.0, -1.0));
        assert_eq!(ndc_to_uv(Vec2::new(-1.0, 1.0)), Vec2::ZERO);
        assert_eq!(ndc_to_uv(uv_to_ndc(Vec2::new(0.25, 0.75))), Vec2::new(0.25, 0.75));
    }

    #[test]
    fn test_focus_uv_outside() {
        // Focus view covering the central half of the peripheral view.
        let m = Mat4::from_scale(glam::Vec3::new(2.0, 2.0, 1.0));
        assert!(focus_uv(&m, Vec2::new(0.5, 0.5)).is_some());
        assert!(focus_uv(&m, Vec2::new(0.1, 0.5)).is_none());
        assert!(focus_uv(&m, Vec2::new(0.5, 0.9)).is_none());

        let behind = Mat4::from_cols(Vec4::X, Vec4::Y, Vec4::Z, Vec4::new(0.0, 0.0, 0.0, -1.0));
        assert!(focus_uv(&behind, Vec2::new(0.5, 0.5)).is_none());
    }

    #[test]
    fn test_hard_edge_without_smoothing() {
        assert_eq!(edge_alpha(Vec2::new(0.0, 0.5), 0.0, 0.1), 1.0);
        assert_eq!(edge_alpha(Vec2::new(0.5, 0.5), 0.0, 0.1), 1.0);
        assert_eq!(edge_alpha(Vec2::new(-0.01, 0.5), 0.0, 0.1), 0.0);
    }

    #[test]
    fn test_edge_alpha_monotonic_toward_center() {
        for smoothing in [0.05f32, 0.1, 0.2, 0.35, 0.5] {
            let mut last = 0.0;
            for i in 0..=500 {
                let x = i as f32 / 1000.0;
                let alpha = edge_alpha(Vec2::new(x, 0.5), smoothing, 0.1);
                assert!(alpha + 1e-6 >= last, "smoothing {} at {}: {} < {}", smoothing, x, alpha, last);
                last = alpha;
            }
        }
    }

    #[test]
    fn test_transition_band_grows_with_smoothing() {
        let band = |smoothing: f32| {
            (0..=500)
                .map(|i| i as f32 / 1000.0)
                .filter(|x| edge_alpha(Vec2::new(*x, 0.5), smoothing, 0.1) < 1.0)
                .count()
        };
        let widths: Vec<usize> = [0.0f32, 0.05, 0.1, 0.2, 0.3, 0.5].iter().map(|s| band(*s)).collect();
        for pair in widths.windows(2) {
            assert!(pair[1] > pair[0], "{:?}", widths);
        }
    }

    #[test]
    fn test_alpha_floor_applies_beyond_margin() {
        // Smoothing 0.5 keeps the raw falloff below 0.5 near x = 0.2.
        let raw = edge_alpha(Vec2::new(0.2, 0.5), 0.5, 0.3);
        assert!(raw < ALPHA_FLOOR);
        let floored = edge_alpha(Vec2::new(0.2, 0.5), 0.5, 0.1);
        assert_eq!(floored, ALPHA_FLOOR);
    }

    #[test]
    fn test_composite_over() {
        let blend = BlendOptions::default();
        let out = composite(
            Vec2::splat(0.5),
            Vec4::new(0.0, 0.0, 1.0, 1.0),
            &Mat4::IDENTITY,
            |_| Vec4::new(0.5, 0.0, 0.0, 0.5),
            &blend,
        );
        assert!(out.abs_diff_eq(Vec4::new(0.5, 0.0, 0.5, 1.0), 1e-6));
    }

    #[test]
    fn test_composite_outside_focus_is_peripheral() {
        let m = Mat4::from_scale(glam::Vec3::new(4.0, 4.0, 1.0));
        let out = composite(
            Vec2::new(0.05, 0.05),
            Vec4::new(0.2, 0.4, 0.6, 1.0),
            &m,
            |_| panic!("focus must not be sampled"),
            &BlendOptions::default(),
        );
        assert!(out.abs_diff_eq(Vec4::new(0.2, 0.4, 0.6, 1.0), 1e-6));
    }

    #[test]
    fn test_debug_outputs_focus_only() {
        let blend = BlendOptions {
            debug_focus_view: true,
            ..Default::default()
        };
        let out = composite(
            Vec2::splat(0.5),
            Vec4::new(0.0, 0.0, 1.0, 1.0),
            &Mat4::IDENTITY,
            |_| Vec4::new(0.5, 0.0, 0.0, 0.5),
            &blend,
        );
        assert!(out.abs_diff_eq(Vec4::new(0.5, 0.0, 0.0, 1.0), 1e-6));
    }
}
