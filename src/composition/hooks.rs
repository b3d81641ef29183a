//! Entry points handed to the dispatch layer in place of the runtime's.
//!
//! The trampolines are plain `extern "system"` functions, so they reach the
//! factory through a weak process-wide pointer installed by
//! [`install_factory`].

use std::ffi::{c_char, CStr};
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use openxr_sys as xr;
use parking_lot::RwLock;

use super::{CompositionFrameworkFactory, InterceptionRegistry, LayerContext, NativeDeviceResolver};
use crate::error::LayerResult;
use crate::runtime::OpenXrDispatch;

lazy_static! {
    static ref ACTIVE_FACTORY: RwLock<Weak<CompositionFrameworkFactory>> = RwLock::new(Weak::new());
}

fn active_factory() -> Option<Arc<CompositionFrameworkFactory>> {
    ACTIVE_FACTORY.read().upgrade()
}

/// Register the session entry points with `interceptions`.
pub fn register_session_hooks(interceptions: &InterceptionRegistry) {
    // SAFETY: the dispatch layer casts the pointer back to the entry point's
    // real signature before calling it.
    unsafe {
        interceptions.register(
            "xrCreateSession",
            std::mem::transmute::<xr::pfn::CreateSession, xr::pfn::VoidFunction>(hook_create_session),
        );
        interceptions.register(
            "xrDestroySession",
            std::mem::transmute::<xr::pfn::DestroySession, xr::pfn::VoidFunction>(hook_destroy_session),
        );
    }
}

/// Create the process's factory on top of the next layer and make it the
/// target of the session trampolines.
pub fn install_factory(
    context: &LayerContext,
    get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
) -> LayerResult<Arc<CompositionFrameworkFactory>> {
    if let Err(e) = crate::logging::init_logging(None) {
        eprintln!("quadviews: file logging unavailable: {}", e);
    }

    let interceptions = Arc::new(InterceptionRegistry::default());
    register_session_hooks(&interceptions);
    let runtime = Arc::new(OpenXrDispatch::new(get_instance_proc_addr, interceptions.clone()));
    let factory = context.create_factory(interceptions, runtime, Box::new(NativeDeviceResolver))?;
    *ACTIVE_FACTORY.write() = Arc::downgrade(&factory);
    Ok(factory)
}

/// `xrGetInstanceProcAddr` post-hook for the dispatch layer.
///
/// # Safety
/// `name` must be a valid C string and `function` a valid pointer.
pub unsafe extern "system" fn xr_get_instance_proc_addr_post(
    _instance: xr::Instance,
    name: *const c_char,
    function: *mut Option<xr::pfn::VoidFunction>,
) {
    if name.is_null() || function.is_null() {
        return;
    }
    let Some(factory) = active_factory() else {
        return;
    };
    if let Ok(name) = CStr::from_ptr(name).to_str() {
        factory.xr_get_instance_proc_addr_post(name, &mut *function);
    }
}

unsafe extern "system" fn hook_create_session(
    instance: xr::Instance,
    info: *const xr::SessionCreateInfo,
    session: *mut xr::Session,
) -> xr::Result {
    if info.is_null() || session.is_null() {
        return xr::Result::ERROR_VALIDATION_FAILURE;
    }
    let Some(factory) = active_factory() else {
        log::error!("[COMPOSITION] xrCreateSession called without a factory");
        return xr::Result::ERROR_RUNTIME_FAILURE;
    };

    match factory.create_session(instance, &*info) {
        Ok(created) => {
            *session = created;
            xr::Result::SUCCESS
        },
        Err(e) => {
            log::error!("[COMPOSITION] xrCreateSession failed: {}", e);
            e.to_xr_result()
        },
    }
}

unsafe extern "system" fn hook_destroy_session(session: xr::Session) -> xr::Result {
    let Some(factory) = active_factory() else {
        log::error!("[COMPOSITION] xrDestroySession called without a factory");
        return xr::Result::ERROR_RUNTIME_FAILURE;
    };

    match factory.destroy_session(session) {
        Ok(()) => xr::Result::SUCCESS,
        Err(e) => {
            log::error!("[COMPOSITION] xrDestroySession failed: {}", e);
            e.to_xr_result()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_hooks_registered() {
        let interceptions = InterceptionRegistry::default();
        register_session_hooks(&interceptions);
        assert!(interceptions.is_registered("xrCreateSession"));
        assert!(interceptions.is_registered("xrDestroySession"));
        assert!(!interceptions.is_registered("xrEndFrame"));
    }

    #[test]
    fn test_hooks_without_factory_fail() {
        let result = unsafe { hook_destroy_session(xr::Session::from_raw(1)) };
        assert_eq!(result, xr::Result::ERROR_RUNTIME_FAILURE);
        let result = unsafe { hook_create_session(xr::Instance::NULL, std::ptr::null(), std::ptr::null_mut()) };
        assert_eq!(result, xr::Result::ERROR_VALIDATION_FAILURE);
    }
}
