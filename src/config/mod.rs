//! Layer configuration management.
//!
//! This module provides centralized, thread-safe configuration for the
//! composition layer. Settings are loaded once from the settings file (or
//! JSON), kept behind a `parking_lot::RwLock`, and snapshotted by every new
//! session so that values stay immutable for the lifetime of that session.

pub mod layer;

pub use layer::{
    get_layer_settings, reset_layer_settings, set_layer_settings, LayerSettings, SettingsFilter,
    LAYER_SETTINGS,
};
