//! Layer settings.
//!
//! All user-tunable values of the layer in one typed struct, read once per
//! session. Settings come either from the plain `name=value` settings file or
//! from JSON, and are clamped to their documented ranges before use.

use std::path::Path;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::LayerResult;

/// Centralized layer configuration.
///
/// A session takes a snapshot of these values when its composition framework
/// is created; later updates only affect sessions created afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerSettings {
    /// Pixel density of the peripheral views relative to the runtime's recommendation (>= 0.1).
    pub peripheral_multiplier: f32,

    /// Pixel density of the focus views relative to the runtime's recommendation (>= 0.1).
    pub focus_multiplier: f32,

    /// Half-width of the fixed focus region, in NDC units (0.1-0.9).
    pub horizontal_fixed_section: f32,

    /// Half-height of the fixed focus region, in NDC units (0.1-0.9).
    pub vertical_fixed_section: f32,

    /// Half-width of the gaze-steered focus region, in NDC units (0.1-0.9).
    pub horizontal_focus_section: f32,

    /// Half-height of the gaze-steered focus region, in NDC units (0.1-0.9).
    pub vertical_focus_section: f32,

    /// Horizontal offset of the fixed focus region (-0.5-0.5). Mirrored for the left eye.
    pub horizontal_fixed_offset: f32,

    /// Vertical offset of the fixed focus region (-0.5-0.5).
    pub vertical_fixed_offset: f32,

    /// Horizontal offset applied to the gaze point (-0.5-0.5). Mirrored for the left eye.
    pub horizontal_focus_offset: f32,

    /// Vertical offset applied to the gaze point (-0.5-0.5).
    pub vertical_focus_offset: f32,

    /// How much the focus region widens horizontally with gaze eccentricity (0-2).
    pub horizontal_focus_widening_multiplier: f32,

    /// How much the focus region widens vertically with gaze eccentricity (0-2).
    pub vertical_focus_widening_multiplier: f32,

    /// Gaze eccentricity below which no widening happens (0-0.5).
    pub focus_widening_deadzone: f32,

    /// Steer the focus region with eye tracking when available.
    pub prefer_foveated_rendering: bool,

    /// Ignore eye tracking even when available.
    pub force_no_eye_tracking: bool,

    /// Width of the focus edge blend in texture space (0-0.5). 0 disables smoothing.
    pub smoothen_focus_view_edges: f32,

    /// Distance from the focus edges beyond which alpha never drops under 0.5 (0-0.5).
    pub smoothing_floor_margin: f32,

    /// Contrast-adaptive sharpening of the focus view (0-1). 0 disables the pass.
    pub sharpen_focus_view: f32,

    /// Whether submitted textures are already premultiplied by alpha.
    pub premultiplied_alpha: bool,

    /// Output the focus view alone, unblended.
    pub debug_focus_view: bool,

    /// Number of images in private (composition-only) swapchains (2-8).
    pub swapchain_depth: u32,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            peripheral_multiplier: 0.5,
            focus_multiplier: 1.0,
            horizontal_fixed_section: 0.5,
            vertical_fixed_section: 0.45,
            horizontal_focus_section: 0.35,
            vertical_focus_section: 0.35,
            horizontal_fixed_offset: 0.0,
            vertical_fixed_offset: 0.0,
            horizontal_focus_offset: 0.0,
            vertical_focus_offset: 0.0,
            horizontal_focus_widening_multiplier: 0.5,
            vertical_focus_widening_multiplier: 0.2,
            focus_widening_deadzone: 0.15,
            prefer_foveated_rendering: true,
            force_no_eye_tracking: false,
            smoothen_focus_view_edges: 0.2,
            smoothing_floor_margin: 0.1,
            sharpen_focus_view: 0.7,
            premultiplied_alpha: true,
            debug_focus_view: false,
            swapchain_depth: 3,
        }
    }
}

/// Identifies which `[section]`s of a settings file apply to the current process.
#[derive(Debug, Clone, Default)]
pub struct SettingsFilter {
    pub application_name: String,
    pub executable_name: String,
    pub runtime_name: String,
    pub system_name: String,
}

impl SettingsFilter {
    /// Decide whether a section header (without brackets) is active.
    fn matches(&self, section: &str) -> bool {
        if let Some(app) = section.strip_prefix("app:") {
            self.application_name.contains(app)
        } else if let Some(exe) = section.strip_prefix("exe:") {
            self.executable_name.contains(exe)
        } else {
            self.runtime_name.contains(section) || self.system_name.contains(section)
        }
    }
}

fn clamp_f32(value: f32, min: f32, max: f32, default: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}

impl LayerSettings {
    /// Validate and clamp settings to acceptable ranges.
    pub fn validate(&mut self) {
        let d = Self::default();
        self.peripheral_multiplier = clamp_f32(self.peripheral_multiplier, 0.1, f32::MAX, d.peripheral_multiplier);
        self.focus_multiplier = clamp_f32(self.focus_multiplier, 0.1, f32::MAX, d.focus_multiplier);
        self.horizontal_fixed_section =
            clamp_f32(self.horizontal_fixed_section, 0.1, 0.9, d.horizontal_fixed_section);
        self.vertical_fixed_section = clamp_f32(self.vertical_fixed_section, 0.1, 0.9, d.vertical_fixed_section);
        self.horizontal_focus_section =
            clamp_f32(self.horizontal_focus_section, 0.1, 0.9, d.horizontal_focus_section);
        self.vertical_focus_section = clamp_f32(self.vertical_focus_section, 0.1, 0.9, d.vertical_focus_section);
        self.horizontal_fixed_offset = clamp_f32(self.horizontal_fixed_offset, -0.5, 0.5, 0.0);
        self.vertical_fixed_offset = clamp_f32(self.vertical_fixed_offset, -0.5, 0.5, 0.0);
        self.horizontal_focus_offset = clamp_f32(self.horizontal_focus_offset, -0.5, 0.5, 0.0);
        self.vertical_focus_offset = clamp_f32(self.vertical_focus_offset, -0.5, 0.5, 0.0);
        self.horizontal_focus_widening_multiplier = clamp_f32(
            self.horizontal_focus_widening_multiplier,
            0.0,
            2.0,
            d.horizontal_focus_widening_multiplier,
        );
        self.vertical_focus_widening_multiplier = clamp_f32(
            self.vertical_focus_widening_multiplier,
            0.0,
            2.0,
            d.vertical_focus_widening_multiplier,
        );
        self.focus_widening_deadzone =
            clamp_f32(self.focus_widening_deadzone, 0.0, 0.5, d.focus_widening_deadzone);
        self.smoothen_focus_view_edges =
            clamp_f32(self.smoothen_focus_view_edges, 0.0, 0.5, d.smoothen_focus_view_edges);
        self.smoothing_floor_margin = clamp_f32(self.smoothing_floor_margin, 0.0, 0.5, d.smoothing_floor_margin);
        self.sharpen_focus_view = clamp_f32(self.sharpen_focus_view, 0.0, 1.0, d.sharpen_focus_view);
        self.swapchain_depth = self.swapchain_depth.clamp(2, 8);
    }

    /// Reset all settings to defaults.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the focus region should follow the eye gaze.
    pub fn use_eye_tracking(&self) -> bool {
        self.prefer_foveated_rendering && !self.force_no_eye_tracking
    }

    /// Parse the plain settings format.
    ///
    /// One `name=value` statement per line. Lines starting with `#` or `//`
    /// are comments. A `[section]` line toggles whether the following
    /// statements apply: `[app:<name>]` and `[exe:<name>]` match the
    /// application and executable names, any other section matches the
    /// runtime or system name. Unknown options and malformed lines are logged
    /// and skipped.
    pub fn parse(text: &str, filter: &SettingsFilter) -> Self {
        let mut settings = Self::default();
        let mut active = true;

        for (index, raw_line) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            if line.len() >= 2 && line.starts_with('[') && line.ends_with(']') {
                active = filter.matches(&line[1..line.len() - 1]);
                continue;
            }

            if !active {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                log::warn!("[CONFIG] L{}: Improperly formatted option", line_number);
                continue;
            };

            let (name, value) = (name.trim(), value.trim());
            match settings.apply(name, value) {
                Ok(true) => log::info!("[CONFIG]   Found option '{}={}'", name, value),
                Ok(false) => log::warn!("[CONFIG] L{}: Unrecognized option '{}'", line_number, name),
                Err(e) => log::warn!("[CONFIG] L{}: Parsing error for '{}': {}", line_number, name, e),
            }
        }

        settings.validate();
        settings
    }

    /// Apply a single statement. Returns `Ok(false)` for unknown names.
    fn apply(&mut self, name: &str, value: &str) -> Result<bool, String> {
        fn float(value: &str) -> Result<f32, String> {
            value.parse::<f32>().map_err(|e| e.to_string())
        }
        fn flag(value: &str) -> Result<bool, String> {
            value.parse::<i32>().map(|v| v != 0).map_err(|e| e.to_string())
        }

        match name {
            "peripheral_multiplier" => self.peripheral_multiplier = float(value)?,
            "focus_multiplier" => self.focus_multiplier = float(value)?,
            "horizontal_fixed_section" => self.horizontal_fixed_section = float(value)?,
            "vertical_fixed_section" => self.vertical_fixed_section = float(value)?,
            "horizontal_focus_section" => self.horizontal_focus_section = float(value)?,
            "vertical_focus_section" => self.vertical_focus_section = float(value)?,
            "horizontal_fixed_offset" => self.horizontal_fixed_offset = float(value)?,
            "vertical_fixed_offset" => self.vertical_fixed_offset = float(value)?,
            "horizontal_focus_offset" => self.horizontal_focus_offset = float(value)?,
            "vertical_focus_offset" => self.vertical_focus_offset = float(value)?,
            "horizontal_focus_widening_multiplier" => {
                self.horizontal_focus_widening_multiplier = float(value)?
            },
            "vertical_focus_widening_multiplier" => {
                self.vertical_focus_widening_multiplier = float(value)?
            },
            "focus_widening_deadzone" => self.focus_widening_deadzone = float(value)?,
            "prefer_foveated_rendering" => self.prefer_foveated_rendering = flag(value)?,
            "force_no_eye_tracking" => self.force_no_eye_tracking = flag(value)?,
            "smoothen_focus_view_edges" => self.smoothen_focus_view_edges = float(value)?,
            "smoothing_floor_margin" => self.smoothing_floor_margin = float(value)?,
            "sharpen_focus_view" => self.sharpen_focus_view = float(value)?,
            "premultiplied_alpha" => self.premultiplied_alpha = flag(value)?,
            "debug_focus_view" => self.debug_focus_view = flag(value)?,
            "swapchain_depth" => {
                self.swapchain_depth = value.parse::<u32>().map_err(|e| e.to_string())?
            },
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Load the settings file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path, filter: &SettingsFilter) -> LayerResult<Self> {
        log::info!("[CONFIG] Trying to locate configuration file at {}", path.display());
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text, filter)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[CONFIG] Not found");
                Ok(Self::default())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Parse JSON settings. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> LayerResult<Self> {
        let mut settings: Self = serde_json::from_str(json)?;
        settings.validate();
        Ok(settings)
    }
}

lazy_static! {
    /// Global layer configuration.
    ///
    /// Thread-safe access via `parking_lot::RwLock` (non-poisoning, fast).
    /// Sessions snapshot it with [`get_layer_settings`] when they start.
    pub static ref LAYER_SETTINGS: RwLock<LayerSettings> = RwLock::new(LayerSettings::default());
}

/// Get a snapshot of the current settings.
pub fn get_layer_settings() -> LayerSettings {
    LAYER_SETTINGS.read().clone()
}

/// Replace the current settings (batch update).
pub fn set_layer_settings(settings: LayerSettings) {
    let mut current = LAYER_SETTINGS.write();
    *current = settings;
    current.validate();
    log::debug!("[CONFIG] Layer settings updated: {:?}", *current);
}

/// Reset all layer settings to defaults.
pub fn reset_layer_settings() {
    LAYER_SETTINGS.write().reset();
    log::debug!("[CONFIG] Layer settings reset to defaults");
}
