//! Quad-view composition framework for an OpenXR API layer.
//!
//! Applications render four views per frame (a low-resolution peripheral
//! view and a high-resolution focus view per eye). The layer composites them
//! into the stereo pair the runtime expects.
//!
//! - [`composition`]: per-session framework, factory and session registry
//! - [`swapchain`]: runtime-backed and private swapchains shared across devices
//! - [`graphics`]: device abstraction and its backends
//! - [`projection`]: the quad-view projection pass
//! - [`layer`]: per-eye composition of a submitted projection layer

pub mod composition;
pub mod config;
pub mod error;
pub mod graphics;
pub mod layer;
pub mod logging;
pub mod projection;
pub mod runtime;
pub mod swapchain;

#[cfg(test)]
mod testing;

pub use composition::{CompositionFramework, CompositionFrameworkFactory, LayerContext};
pub use error::{ErrorKind, LayerError, LayerResult};
pub use layer::QuadViewCompositor;
