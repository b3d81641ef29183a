//! Focus view placement.
//!
//! The focus view is a rectangle in the peripheral view's NDC, centered on
//! the gaze point (or on the resting gaze for fixed foveation), converted back
//! into a field of view.

use glam::{Vec2, Vec3, Vec4};

use super::view::{projection_matrix, Fov, Pose};
use crate::config::LayerSettings;
use crate::error::{LayerError, LayerResult};

const PROJECT_NEAR: f32 = 0.001;
const PROJECT_FAR: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }

    /// Horizontal offsets mirror across the eyes.
    fn mirror(self, horizontal: f32) -> f32 {
        match self {
            Eye::Left => -horizontal,
            Eye::Right => horizontal,
        }
    }
}

/// Project a point given in view space onto an eye's image plane.
///
/// Returns the NDC position, or `None` when the point sits on the eye plane.
pub fn project_point(eye_pose: &Pose, fov: &Fov, point: Vec3) -> Option<Vec2> {
    let projection = projection_matrix(fov, PROJECT_NEAR, PROJECT_FAR);
    let clip = projection * eye_pose.inverse().to_mat4() * Vec4::new(point.x, point.y, point.z, 1.0);
    if clip.w.abs() < f32::EPSILON {
        return None;
    }
    Some(Vec2::new(clip.x / clip.w, clip.y / clip.w))
}

/// Field of view covering the NDC box `[min, max]` of `fov`.
pub fn bounding_fov(fov: &Fov, min: Vec2, max: Vec2) -> Fov {
    let (tan_left, tan_right, tan_up, tan_down) = fov.tangents();
    let horizontal = |x: f32| (tan_left + (x + 1.0) / 2.0 * (tan_right - tan_left)).atan();
    let vertical = |y: f32| (tan_down + (y + 1.0) / 2.0 * (tan_up - tan_down)).atan();
    Fov {
        angle_left: horizontal(min.x),
        angle_right: horizontal(max.x),
        angle_up: vertical(max.y),
        angle_down: vertical(min.y),
    }
}

fn section_box(center: Vec2, section: Vec2) -> (Vec2, Vec2) {
    let min = (center - section).clamp(Vec2::splat(-1.0), Vec2::splat(1.0));
    let max = (center + section).clamp(Vec2::splat(-1.0), Vec2::splat(1.0));
    (min, max)
}

/// Focus placement for one eye.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Foveation {
    pub eye: Eye,
    pub eye_pose: Pose,
    pub fov: Fov,
    /// Resting gaze point in NDC.
    pub center: Vec2,
}

impl Foveation {
    pub fn new(eye: Eye, eye_pose: Pose, fov: Fov) -> LayerResult<Self> {
        fov.check()?;
        let center = project_point(&eye_pose, &fov, Vec3::NEG_Z)
            .ok_or_else(|| LayerError::Configuration(format!("{:?} eye cannot project its forward axis", eye)))?;
        Ok(Self {
            eye,
            eye_pose,
            fov,
            center,
        })
    }

    /// Focus FOV without eye tracking.
    pub fn fixed(&self, settings: &LayerSettings) -> Fov {
        let gaze = self.center
            + Vec2::new(
                self.eye.mirror(settings.horizontal_fixed_offset),
                settings.vertical_fixed_offset,
            );
        let section = Vec2::new(settings.horizontal_fixed_section, settings.vertical_fixed_section);
        let (min, max) = section_box(gaze, section);
        bounding_fov(&self.fov, min, max)
    }

    /// Focus FOV following a gaze direction given in view space.
    ///
    /// Falls back to the fixed placement when the gaze cannot be projected.
    pub fn gaze(&self, gaze_direction: Vec3, settings: &LayerSettings) -> Fov {
        let Some(projected) = project_point(&self.eye_pose, &self.fov, gaze_direction) else {
            log::debug!("[FOVEATION] Gaze {:?} not projectable, using fixed focus", gaze_direction);
            return self.fixed(settings);
        };

        let gaze = projected
            + Vec2::new(
                self.eye.mirror(settings.horizontal_focus_offset),
                settings.vertical_focus_offset,
            );
        let eccentricity = (gaze - self.center).abs();
        let widen = |e: f32, multiplier: f32| {
            1.0 + (e - settings.focus_widening_deadzone).clamp(0.0, 1.0) * multiplier
        };
        let section = Vec2::new(
            settings.horizontal_focus_section * widen(eccentricity.x, settings.horizontal_focus_widening_multiplier),
            settings.vertical_focus_section * widen(eccentricity.y, settings.vertical_focus_widening_multiplier),
        );
        let (min, max) = section_box(gaze, section);
        bounding_fov(&self.fov, min, max)
    }
}
