//! Session lifecycle: creates a framework per session and finds it again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use openxr_sys as xr;

use super::{CompositionFramework, InterceptionRegistry, SessionRegistry};
use crate::config::get_layer_settings;
use crate::error::{LayerError, LayerResult};
use crate::graphics::GraphicsDevice;
use crate::runtime::RuntimeDispatch;

/// Finds the application's graphics device in a session create info.
pub trait ApplicationDeviceResolver: Send + Sync {
    fn resolve(&self, info: &xr::SessionCreateInfo) -> LayerResult<Arc<dyn GraphicsDevice>>;
}

impl<F> ApplicationDeviceResolver for F
where
    F: Fn(&xr::SessionCreateInfo) -> LayerResult<Arc<dyn GraphicsDevice>> + Send + Sync,
{
    fn resolve(&self, info: &xr::SessionCreateInfo) -> LayerResult<Arc<dyn GraphicsDevice>> {
        self(info)
    }
}

/// Resolver for graphics bindings the layer can wrap natively.
///
/// Only D3D11 bindings are handled, on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDeviceResolver;

impl ApplicationDeviceResolver for NativeDeviceResolver {
    fn resolve(&self, info: &xr::SessionCreateInfo) -> LayerResult<Arc<dyn GraphicsDevice>> {
        #[cfg(windows)]
        {
            // SAFETY: the chain comes straight from the application's xrCreateSession call.
            if let Some(binding) = unsafe { crate::runtime::find_d3d11_binding(info) } {
                return crate::graphics::d3d11::D3D11Device::wrap_application(binding.device);
            }
        }
        #[cfg(not(windows))]
        let _ = info;

        Err(LayerError::Configuration(
            "application graphics API is not supported".to_string(),
        ))
    }
}

/// Process-wide layer state, passed explicitly to whoever needs it.
///
/// Hands out at most one [`CompositionFrameworkFactory`] at a time. The claim
/// lives in this value, not in a global: the layer entry point creates one
/// context for the process and passes it to [`super::hooks::install_factory`].
/// Separate contexts claim independently.
#[derive(Debug, Default)]
pub struct LayerContext {
    factory_claimed: Arc<AtomicBool>,
}

impl LayerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_factory(
        &self,
        interceptions: Arc<InterceptionRegistry>,
        runtime: Arc<dyn RuntimeDispatch>,
        resolver: Box<dyn ApplicationDeviceResolver>,
    ) -> LayerResult<Arc<CompositionFrameworkFactory>> {
        if self
            .factory_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("[COMPOSITION] A composition framework factory already exists");
            return Err(LayerError::DuplicateInstance);
        }

        log::info!("[COMPOSITION] Composition framework factory created");
        Ok(Arc::new(CompositionFrameworkFactory {
            claim: self.factory_claimed.clone(),
            interceptions,
            runtime,
            resolver,
            sessions: SessionRegistry::default(),
        }))
    }

    pub fn has_factory(&self) -> bool {
        self.factory_claimed.load(Ordering::Acquire)
    }
}

/// Creates a [`CompositionFramework`] for every session and tears it down
/// with the session.
pub struct CompositionFrameworkFactory {
    claim: Arc<AtomicBool>,
    interceptions: Arc<InterceptionRegistry>,
    runtime: Arc<dyn RuntimeDispatch>,
    resolver: Box<dyn ApplicationDeviceResolver>,
    sessions: SessionRegistry,
}

impl CompositionFrameworkFactory {
    /// Called by the dispatch layer after it resolved `name`. Substitutes the
    /// layer's entry point for intercepted functions.
    pub fn xr_get_instance_proc_addr_post(
        &self,
        name: &str,
        function: &mut Option<xr::pfn::VoidFunction>,
    ) -> bool {
        self.interceptions.resolve(name, function)
    }

    /// Create the session on the runtime, then its framework.
    ///
    /// If the framework cannot be created the runtime session is destroyed
    /// again and the error returned.
    pub fn create_session(&self, instance: xr::Instance, info: &xr::SessionCreateInfo) -> LayerResult<xr::Session> {
        let session = self.runtime.create_session(instance, info)?;

        let framework = self
            .resolver
            .resolve(info)
            .and_then(|device| {
                CompositionFramework::new(session, self.runtime.clone(), device, get_layer_settings())
            })
            .and_then(|framework| self.sessions.insert(session, Arc::new(framework)));

        if let Err(e) = framework {
            log::error!("[COMPOSITION] Session {:?} framework creation failed: {}", session, e);
            if let Err(destroy) = self.runtime.destroy_session(session) {
                log::warn!("[COMPOSITION] Destroying session {:?} failed: {}", session, destroy);
            }
            return Err(e);
        }

        log::info!("[COMPOSITION] Session {:?} created", session);
        Ok(session)
    }

    /// Drop the session's framework, then destroy the session on the runtime.
    pub fn destroy_session(&self, session: xr::Session) -> LayerResult<()> {
        match self.sessions.remove(session) {
            Some(framework) => drop(framework),
            None => log::warn!("[COMPOSITION] Session {:?} has no composition framework", session),
        }
        self.runtime.destroy_session(session)?;
        log::info!("[COMPOSITION] Session {:?} destroyed", session);
        Ok(())
    }

    /// Framework of a live session.
    ///
    /// Fails with [`LayerError::NotFound`] before creation completes and once
    /// destruction has begun.
    pub fn get_composition_framework(&self, session: xr::Session) -> LayerResult<Arc<CompositionFramework>> {
        self.sessions.get(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn interceptions(&self) -> &Arc<InterceptionRegistry> {
        &self.interceptions
    }
}

impl Drop for CompositionFrameworkFactory {
    fn drop(&mut self) {
        let remaining = self.sessions.drain();
        if !remaining.is_empty() {
            log::warn!(
                "[COMPOSITION] Factory dropped with {} live session(s)",
                remaining.len()
            );
        }
        drop(remaining);
        self.claim.store(false, Ordering::Release);
        log::info!("[COMPOSITION] Composition framework factory destroyed");
    }
}
