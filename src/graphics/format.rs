//! Generic pixel formats and their native encodings.
//!
//! Every device speaks its own native format codes (DXGI values for D3D11 and
//! the software device, VkFormat values for wgpu). Cross-device operations
//! normalize through [`GenericFormat`].

use serde::{Deserialize, Serialize};

/// Pixel formats understood by the composition framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericFormat {
    Unknown,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R10G10B10A2Unorm,
    R16G16B16A16Float,
    R11G11B10Float,
    D32Float,
    D24UnormS8Uint,
    D16Unorm,
    D32FloatS8X24Uint,
}

/// (generic, DXGI_FORMAT, VkFormat)
const FORMAT_TABLE: &[(GenericFormat, i64, i64)] = &[
    (GenericFormat::R8G8B8A8Unorm, 28, 37),
    (GenericFormat::R8G8B8A8UnormSrgb, 29, 43),
    (GenericFormat::B8G8R8A8Unorm, 87, 44),
    (GenericFormat::B8G8R8A8UnormSrgb, 91, 50),
    (GenericFormat::R10G10B10A2Unorm, 24, 64),
    (GenericFormat::R16G16B16A16Float, 10, 97),
    (GenericFormat::R11G11B10Float, 26, 122),
    (GenericFormat::D32Float, 40, 126),
    (GenericFormat::D24UnormS8Uint, 45, 129),
    (GenericFormat::D16Unorm, 55, 124),
    (GenericFormat::D32FloatS8X24Uint, 20, 130),
];

/// DXGI_FORMAT values grouped by typeless family. Members of one family can
/// view the same memory.
const DXGI_FAMILIES: &[&[i64]] = &[
    // R32G8X24_TYPELESS, D32_FLOAT_S8X24_UINT, R32_FLOAT_X8X24_TYPELESS, X32_TYPELESS_G8X24_UINT
    &[19, 20, 21, 22],
    // R16G16B16A16_TYPELESS .. SINT
    &[9, 10, 11, 12, 13, 14],
    // R10G10B10A2_TYPELESS, UNORM, UINT
    &[23, 24, 25],
    // R8G8B8A8_TYPELESS .. SINT
    &[27, 28, 29, 30, 31, 32],
    // R32_TYPELESS, D32_FLOAT, R32_FLOAT, R32_UINT, R32_SINT
    &[39, 40, 41, 42, 43],
    // R24G8_TYPELESS, D24_UNORM_S8_UINT, R24_UNORM_X8_TYPELESS, X24_TYPELESS_G8_UINT
    &[44, 45, 46, 47],
    // R16_TYPELESS, R16_FLOAT, D16_UNORM, R16_UNORM, R16_UINT, R16_SNORM, R16_SINT
    &[53, 54, 55, 56, 57, 58, 59],
    // B8G8R8A8_UNORM, B8G8R8A8_TYPELESS, B8G8R8A8_UNORM_SRGB
    &[87, 90, 91],
    // B8G8R8X8_UNORM, B8G8R8X8_TYPELESS, B8G8R8X8_UNORM_SRGB
    &[88, 92, 93],
];

/// Whether a texture allocated as DXGI format `allocated` can be used as
/// `requested`.
pub fn dxgi_compatible(allocated: i64, requested: i64) -> bool {
    allocated == requested
        || DXGI_FAMILIES
            .iter()
            .any(|family| family.contains(&allocated) && family.contains(&requested))
}

impl GenericFormat {
    pub fn from_dxgi(code: i64) -> Self {
        FORMAT_TABLE
            .iter()
            .find(|(_, dxgi, _)| *dxgi == code)
            .map(|(format, _, _)| *format)
            .unwrap_or(GenericFormat::Unknown)
    }

    /// DXGI_FORMAT value, 0 (DXGI_FORMAT_UNKNOWN) for `Unknown`.
    pub fn to_dxgi(self) -> i64 {
        FORMAT_TABLE
            .iter()
            .find(|(format, _, _)| *format == self)
            .map(|(_, dxgi, _)| *dxgi)
            .unwrap_or(0)
    }

    pub fn from_vk(code: i64) -> Self {
        FORMAT_TABLE
            .iter()
            .find(|(_, _, vk)| *vk == code)
            .map(|(format, _, _)| *format)
            .unwrap_or(GenericFormat::Unknown)
    }

    /// VkFormat value, 0 (VK_FORMAT_UNDEFINED) for `Unknown`.
    pub fn to_vk(self) -> i64 {
        FORMAT_TABLE
            .iter()
            .find(|(format, _, _)| *format == self)
            .map(|(_, _, vk)| *vk)
            .unwrap_or(0)
    }

    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            GenericFormat::R8G8B8A8UnormSrgb | GenericFormat::B8G8R8A8UnormSrgb
        )
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            GenericFormat::D32Float
                | GenericFormat::D24UnormS8Uint
                | GenericFormat::D16Unorm
                | GenericFormat::D32FloatS8X24Uint
        )
    }

    pub fn is_color(self) -> bool {
        self != GenericFormat::Unknown && !self.is_depth()
    }

    /// Store a linear value the way a texel of this format would hold it.
    ///
    /// Used by the software device so that its textures round like real
    /// hardware formats (8-bit quantization, sRGB encoding, 10-bit channels).
    pub fn quantize(self, linear: [f32; 4]) -> [f32; 4] {
        fn unorm(v: f32, levels: f32) -> f32 {
            (v.clamp(0.0, 1.0) * levels).round() / levels
        }

        match self {
            GenericFormat::R8G8B8A8Unorm | GenericFormat::B8G8R8A8Unorm => {
                linear.map(|c| unorm(c, 255.0))
            },
            GenericFormat::R8G8B8A8UnormSrgb | GenericFormat::B8G8R8A8UnormSrgb => [
                srgb_to_linear(unorm(linear_to_srgb(linear[0]), 255.0)),
                srgb_to_linear(unorm(linear_to_srgb(linear[1]), 255.0)),
                srgb_to_linear(unorm(linear_to_srgb(linear[2]), 255.0)),
                unorm(linear[3], 255.0),
            ],
            GenericFormat::R10G10B10A2Unorm => [
                unorm(linear[0], 1023.0),
                unorm(linear[1], 1023.0),
                unorm(linear[2], 1023.0),
                unorm(linear[3], 3.0),
            ],
            GenericFormat::R11G11B10Float => [linear[0].max(0.0), linear[1].max(0.0), linear[2].max(0.0), 1.0],
            GenericFormat::D16Unorm => [unorm(linear[0], 65535.0), 0.0, 0.0, 1.0],
            GenericFormat::D24UnormS8Uint => [unorm(linear[0], 16_777_215.0), 0.0, 0.0, 1.0],
            _ => linear,
        }
    }
}

impl std::fmt::Display for GenericFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dxgi_and_vk_codes_agree() {
        for (format, dxgi, vk) in FORMAT_TABLE {
            assert_eq!(GenericFormat::from_dxgi(*dxgi), *format);
            assert_eq!(GenericFormat::from_vk(*vk), *format);
            assert_eq!(GenericFormat::from_vk(format.to_vk()).to_dxgi(), *dxgi);
        }
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(GenericFormat::from_dxgi(9999), GenericFormat::Unknown);
        assert_eq!(GenericFormat::Unknown.to_dxgi(), 0);
        assert!(!GenericFormat::Unknown.is_color());
    }

    #[test]
    fn test_dxgi_families() {
        assert!(dxgi_compatible(28, 28));
        assert!(dxgi_compatible(27, 29));
        assert!(dxgi_compatible(29, 28));
        assert!(dxgi_compatible(39, 40));
        assert!(!dxgi_compatible(28, 91));
        assert!(!dxgi_compatible(87, 28));
        assert!(!dxgi_compatible(10, 28));
    }

    #[test]
    fn test_classification() {
        assert!(GenericFormat::R8G8B8A8UnormSrgb.is_srgb());
        assert!(!GenericFormat::R8G8B8A8Unorm.is_srgb());
        assert!(GenericFormat::D24UnormS8Uint.is_depth());
        assert!(GenericFormat::R16G16B16A16Float.is_color());
    }

    #[test]
    fn test_quantize_unorm8() {
        let q = GenericFormat::R8G8B8A8Unorm.quantize([0.5, 1.5, -1.0, 0.25]);
        assert_eq!(q, [128.0 / 255.0, 1.0, 0.0, 64.0 / 255.0]);
    }

    #[test]
    fn test_quantize_srgb_keeps_endpoints() {
        let q = GenericFormat::B8G8R8A8UnormSrgb.quantize([0.0, 1.0, 0.2140, 1.0]);
        assert_eq!(q[0], 0.0);
        assert!((q[1] - 1.0).abs() < 1e-6);
        assert!((q[2] - 0.2140).abs() < 5e-3);
    }

    #[test]
    fn test_srgb_roundtrip() {
        for i in 0..=10 {
            let v = i as f32 / 10.0;
            assert!((srgb_to_linear(linear_to_srgb(v)) - v).abs() < 1e-5);
        }
    }
}
