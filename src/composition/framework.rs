//! Per-session composition state.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use openxr_sys as xr;
use parking_lot::Mutex;

use crate::config::LayerSettings;
use crate::error::{LayerError, LayerResult};
use crate::graphics::{GenericFormat, GraphicsDevice, SharingStrategy, TextureDesc, TextureUsage};
use crate::projection::QuadViewRenderer;
use crate::runtime::RuntimeDispatch;
use crate::swapchain::{FencePair, PrivateSwapchain, SubmittableSwapchain, Swapchain, SwapchainMode};

/// First color, sRGB color and depth formats of the runtime's list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PreferredFormats {
    color: Option<GenericFormat>,
    srgb_color: Option<GenericFormat>,
    depth: Option<GenericFormat>,
}

impl PreferredFormats {
    fn classify(device: &dyn GraphicsDevice, formats: &[i64]) -> Self {
        let mut preferred = Self::default();
        for &native in formats {
            let format = device.translate_to_generic(native);
            if format == GenericFormat::Unknown {
                continue;
            }
            if format.is_depth() {
                preferred.depth.get_or_insert(format);
            } else if format.is_srgb() {
                preferred.srgb_color.get_or_insert(format);
            } else {
                preferred.color.get_or_insert(format);
            }
        }
        preferred
    }
}

/// Composition state of one session.
///
/// Owns the composition device and wraps the application's device. Created
/// when the session is created, dropped when it is destroyed.
pub struct CompositionFramework {
    session: xr::Session,
    runtime: Arc<dyn RuntimeDispatch>,
    settings: LayerSettings,
    application_device: Arc<dyn GraphicsDevice>,
    composition_device: Arc<dyn GraphicsDevice>,
    strategy: SharingStrategy,
    formats: PreferredFormats,
    /// Keeps fence values in signal order across threads.
    fences: Mutex<FencePair>,
    session_data: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl CompositionFramework {
    /// Create the framework with a composition device on the application
    /// device's adapter.
    pub fn new(
        session: xr::Session,
        runtime: Arc<dyn RuntimeDispatch>,
        application_device: Arc<dyn GraphicsDevice>,
        settings: LayerSettings,
    ) -> LayerResult<Self> {
        let composition_device = application_device.create_composition_device()?;
        Self::with_devices(session, runtime, application_device, composition_device, settings)
    }

    /// Create the framework with an explicit composition device.
    pub fn with_devices(
        session: xr::Session,
        runtime: Arc<dyn RuntimeDispatch>,
        application_device: Arc<dyn GraphicsDevice>,
        composition_device: Arc<dyn GraphicsDevice>,
        settings: LayerSettings,
    ) -> LayerResult<Self> {
        let strategy = SharingStrategy::select(application_device.as_ref(), composition_device.as_ref());
        let fences = FencePair::new(application_device.as_ref(), composition_device.as_ref())?;
        let formats = PreferredFormats::classify(
            application_device.as_ref(),
            &runtime.enumerate_swapchain_formats(session)?,
        );

        log::info!(
            "[COMPOSITION] Session {:?}: application {} on {}, composition {} on {} ({:?})",
            session,
            application_device.api(),
            application_device.adapter_luid(),
            composition_device.api(),
            composition_device.adapter_luid(),
            strategy
        );
        log::debug!("[COMPOSITION] Preferred formats: {:?}", formats);

        Ok(Self {
            session,
            runtime,
            settings,
            application_device,
            composition_device,
            strategy,
            formats,
            fences: Mutex::new(fences),
            session_data: OnceLock::new(),
        })
    }

    pub fn session(&self) -> xr::Session {
        self.session
    }

    /// Settings snapshot taken when the session was created.
    pub fn settings(&self) -> &LayerSettings {
        &self.settings
    }

    pub fn application_device(&self) -> &Arc<dyn GraphicsDevice> {
        &self.application_device
    }

    pub fn composition_device(&self) -> &Arc<dyn GraphicsDevice> {
        &self.composition_device
    }

    pub fn sharing_strategy(&self) -> SharingStrategy {
        self.strategy
    }

    /// Attach user data to the session. Only the first call succeeds.
    pub fn set_session_data<T: Any + Send + Sync>(&self, data: T) -> LayerResult<()> {
        self.session_data
            .set(Box::new(data))
            .map_err(|_| LayerError::InvalidCallOrder(format!("session {:?} already has data", self.session)))
    }

    /// Session data, if set and of type `T`.
    pub fn session_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.session_data.get()?.downcast_ref::<T>()
    }

    /// Create a swapchain described in application-device formats.
    ///
    /// With [`SwapchainMode::SUBMIT`] the swapchain is backed by the runtime,
    /// otherwise it is private to the layer.
    pub fn create_swapchain(&self, desc: &TextureDesc, mode: SwapchainMode) -> LayerResult<Arc<dyn Swapchain>> {
        if mode.contains(SwapchainMode::SUBMIT) {
            let swapchain = SubmittableSwapchain::create(
                self.runtime.clone(),
                self.session,
                self.application_device.clone(),
                self.composition_device.clone(),
                desc,
                mode,
                self.strategy,
            )?;
            Ok(Arc::new(swapchain))
        } else {
            let composition_desc = desc.translated(self.application_device.as_ref(), self.composition_device.as_ref());
            let swapchain = PrivateSwapchain::new(
                self.application_device.as_ref(),
                self.composition_device.as_ref(),
                &composition_desc,
                mode,
                self.settings.swapchain_depth,
            )?;
            Ok(Arc::new(swapchain))
        }
    }

    /// Wrap a swapchain the application created so the composition can read
    /// its released images.
    pub fn open_application_swapchain(
        &self,
        handle: xr::Swapchain,
        desc: &TextureDesc,
        mode: SwapchainMode,
    ) -> LayerResult<Arc<dyn Swapchain>> {
        let swapchain = SubmittableSwapchain::open(
            self.runtime.clone(),
            handle,
            self.application_device.clone(),
            self.composition_device.clone(),
            desc,
            mode,
            self.strategy,
        )?;
        Ok(Arc::new(swapchain))
    }

    /// Order the application's submitted work before composition work.
    pub fn serialize_pre_composition(&self) -> LayerResult<()> {
        let value = self.fences.lock().application_to_composition()?;
        log::trace!("[COMPOSITION] Pre-composition barrier at {}", value);
        Ok(())
    }

    /// Order composition work before the runtime consumes its output.
    pub fn serialize_post_composition(&self) -> LayerResult<()> {
        let value = self.fences.lock().composition_to_application()?;
        log::trace!("[COMPOSITION] Post-composition barrier at {}", value);
        Ok(())
    }

    /// Open a composition scope: pre-composition barrier now,
    /// post-composition barrier when the scope ends.
    pub fn begin_composition(&self) -> LayerResult<CompositionScope<'_>> {
        self.serialize_pre_composition()?;
        Ok(CompositionScope {
            framework: self,
            finished: false,
        })
    }

    /// Preferred runtime format for a usage, as an application-device code.
    ///
    /// Returns 0 when the runtime offers no matching format.
    pub fn preferred_swapchain_format(&self, usage: TextureUsage, prefer_srgb: bool) -> i64 {
        let format = if usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            if prefer_srgb {
                self.formats.srgb_color
            } else {
                self.formats.color
            }
        } else if usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
            self.formats.depth
        } else {
            None
        };
        self.application_device
            .translate_from_generic(format.unwrap_or(GenericFormat::Unknown))
    }

    pub fn create_projection_renderer(&self) -> LayerResult<Box<dyn QuadViewRenderer>> {
        self.composition_device.create_projection_renderer()
    }
}

impl Drop for CompositionFramework {
    fn drop(&mut self) {
        self.fences.get_mut().drain();
        log::info!("[COMPOSITION] Session {:?} framework destroyed", self.session);
    }
}

/// Region between the pre- and post-composition barriers.
///
/// Call [`CompositionScope::finish`] to observe the post-composition result.
/// A scope dropped without it still issues the barrier and logs failures.
pub struct CompositionScope<'a> {
    framework: &'a CompositionFramework,
    finished: bool,
}

impl CompositionScope<'_> {
    pub fn framework(&self) -> &CompositionFramework {
        self.framework
    }

    pub fn finish(mut self) -> LayerResult<()> {
        self.finished = true;
        self.framework.serialize_post_composition()
    }
}

impl Drop for CompositionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.framework.serialize_post_composition() {
                log::error!("[COMPOSITION] Post-composition barrier failed: {}", e);
            }
        }
    }
}
