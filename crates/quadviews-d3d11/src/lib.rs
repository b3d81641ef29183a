//! Direct3D 11 devices, shared textures and fences for quad-view composition.
//!
//! Wraps the application's `ID3D11Device` and creates composition devices on
//! the same adapter. Textures and fences are shared between the two through
//! NT handles.

#![cfg(windows)]
#![allow(non_snake_case)]

mod device;
mod projection;
mod resources;

pub use device::{Device, TextureInfo};
pub use projection::{ProjectionPass, ProjectionTargets, SharpenPass};
pub use resources::{Fence, SharedHandle, Texture};

pub type Result<T> = std::result::Result<T, D3D11Error>;

#[derive(Debug, thiserror::Error)]
pub enum D3D11Error {
    #[error("{0}")]
    Windows(#[from] windows_core::Error),
    #[error("No adapter with LUID {0:016x}")]
    AdapterNotFound(u64),
    #[error("Device does not implement {0}")]
    MissingInterface(&'static str),
    #[error("Shader compilation failed: {0}")]
    Shader(String),
    #[error("Null pointer passed for {0}")]
    NullPointer(&'static str),
    #[error("Resource was not created shareable")]
    NotShareable,
    #[error("Fence wait failed for value {0}")]
    FenceWait(u64),
}
