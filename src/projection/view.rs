//! View math: fields of view, poses and projection matrices.
//!
//! Conventions follow OpenXR: right-handed view space looking down -Z, +Y up,
//! angles in radians with left/down negative. Projection matrices map depth
//! to [0, 1] (D3D style).

use glam::{Mat4, Quat, Vec3, Vec4};
use openxr_sys as xr;

use crate::error::{LayerError, LayerResult};

pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 20.0;

/// Field of view of one eye, as four half-angles.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn new(angle_left: f32, angle_right: f32, angle_up: f32, angle_down: f32) -> Self {
        Self {
            angle_left,
            angle_right,
            angle_up,
            angle_down,
        }
    }

    /// Symmetric field of view with the given half-angles.
    pub fn symmetric(horizontal: f32, vertical: f32) -> Self {
        Self::new(-horizontal, horizontal, vertical, -vertical)
    }

    /// Tangents as (left, right, up, down).
    pub fn tangents(&self) -> (f32, f32, f32, f32) {
        (
            self.angle_left.tan(),
            self.angle_right.tan(),
            self.angle_up.tan(),
            self.angle_down.tan(),
        )
    }

    /// Reject fields of view that cannot be projected.
    pub fn check(&self) -> LayerResult<()> {
        let (l, r, u, d) = self.tangents();
        let width = r - l;
        let height = u - d;
        if !width.is_finite() || !height.is_finite() || width.abs() <= f32::EPSILON || height.abs() <= f32::EPSILON {
            return Err(LayerError::Configuration(format!("degenerate field of view {:?}", self)));
        }
        Ok(())
    }

    /// Scale the spread of both axes around their centers.
    pub fn scale(&self, horizontal: f32, vertical: f32) -> Self {
        let (angle_left, angle_right) = scale_range((self.angle_left, self.angle_right), horizontal);
        let (angle_down, angle_up) = scale_range((self.angle_down, self.angle_up), vertical);
        Self {
            angle_left,
            angle_right,
            angle_up,
            angle_down,
        }
    }

    /// Move this FOV's center to a fraction of `range`, keeping its spread
    /// and staying inside `range`.
    pub fn lerp(&self, range: &Fov, horizontal: f32, vertical: f32) -> Self {
        let (angle_left, angle_right) = lerp_range(
            (range.angle_left, range.angle_right),
            (self.angle_left, self.angle_right),
            horizontal,
        );
        let (angle_down, angle_up) = lerp_range(
            (range.angle_down, range.angle_up),
            (self.angle_down, self.angle_up),
            vertical,
        );
        Self {
            angle_left,
            angle_right,
            angle_up,
            angle_down,
        }
    }
}

fn scale_range((lower, upper): (f32, f32), scale: f32) -> (f32, f32) {
    let center = (lower + upper) / 2.0;
    let spread = (upper - lower) * scale;
    (center - spread / 2.0, center + spread / 2.0)
}

fn lerp_range(range: (f32, f32), angles: (f32, f32), t: f32) -> (f32, f32) {
    let spread = angles.1 - angles.0;
    let center = range.0 + t * (range.1 - range.0);
    let mut lower = center - spread / 2.0;
    let mut upper = center + spread / 2.0;
    if upper > range.1 {
        upper = range.1;
        lower = upper - spread;
    } else if lower < range.0 {
        lower = range.0;
        upper = lower + spread;
    }
    (lower, upper)
}

impl From<xr::Fovf> for Fov {
    fn from(fov: xr::Fovf) -> Self {
        Self::new(fov.angle_left, fov.angle_right, fov.angle_up, fov.angle_down)
    }
}

impl From<Fov> for xr::Fovf {
    fn from(fov: Fov) -> Self {
        xr::Fovf {
            angle_left: fov.angle_left,
            angle_right: fov.angle_right,
            angle_up: fov.angle_up,
            angle_down: fov.angle_down,
        }
    }
}

/// Rigid transform of a view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    pub fn new(orientation: Quat, position: Vec3) -> Self {
        Self {
            orientation: orientation.normalize(),
            position,
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position)
    }

    pub fn inverse(&self) -> Self {
        let orientation = self.orientation.inverse();
        Self {
            orientation,
            position: -(orientation * self.position),
        }
    }

    /// `self` expressed in the space of `base`.
    pub fn relative_to(&self, base: &Pose) -> Self {
        let inv = base.inverse();
        Self {
            orientation: (inv.orientation * self.orientation).normalize(),
            position: inv.orientation * self.position + inv.position,
        }
    }
}

impl From<xr::Posef> for Pose {
    fn from(pose: xr::Posef) -> Self {
        let o = pose.orientation;
        let p = pose.position;
        Self::new(Quat::from_xyzw(o.x, o.y, o.z, o.w), Vec3::new(p.x, p.y, p.z))
    }
}

impl From<Pose> for xr::Posef {
    fn from(pose: Pose) -> Self {
        let o = pose.orientation;
        let p = pose.position;
        xr::Posef {
            orientation: xr::Quaternionf {
                x: o.x,
                y: o.y,
                z: o.z,
                w: o.w,
            },
            position: xr::Vector3f { x: p.x, y: p.y, z: p.z },
        }
    }
}

/// Projection matrix for an asymmetric field of view.
///
/// Depth maps to [0, 1] between `near` and `far`.
pub fn projection_matrix(fov: &Fov, near: f32, far: f32) -> Mat4 {
    let (tan_left, tan_right, tan_up, tan_down) = fov.tangents();
    let width = tan_right - tan_left;
    let height = tan_up - tan_down;
    let range = far - near;

    Mat4::from_cols(
        Vec4::new(2.0 / width, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 / height, 0.0, 0.0),
        Vec4::new(
            (tan_right + tan_left) / width,
            (tan_up + tan_down) / height,
            -far / range,
            -1.0,
        ),
        Vec4::new(0.0, 0.0, -(far * near) / range, 0.0),
    )
}
