//! Composition framework and session registry.
//!
//! One [`CompositionFramework`] exists per session. It owns the composition
//! device, wraps the application's device and provides the barriers that
//! order application rendering, composition and runtime consumption. The
//! [`CompositionFrameworkFactory`] creates it when the session is created and
//! drops it before the session is destroyed.

mod factory;
mod framework;
pub mod hooks;
mod registry;

#[cfg(test)]
mod tests;

pub use factory::{ApplicationDeviceResolver, CompositionFrameworkFactory, LayerContext, NativeDeviceResolver};
pub use framework::{CompositionFramework, CompositionScope};
pub use registry::{InterceptionRegistry, SessionRegistry};
