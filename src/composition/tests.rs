use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openxr_sys as xr;

use super::*;
use crate::config::LayerSettings;
use crate::error::{ErrorKind, LayerError, LayerResult};
use crate::graphics::{AdapterLuid, GraphicsDevice, SharingStrategy, SoftwareDevice, TextureDesc, TextureUsage};
use crate::runtime::RuntimeDispatch;
use crate::swapchain::{Swapchain, SwapchainMode};
use crate::testing::{software_device, MockRuntime, D32, RGBA8, RGBA8_SRGB};

fn session_info() -> xr::SessionCreateInfo {
    xr::SessionCreateInfo {
        ty: xr::SessionCreateInfo::TYPE,
        next: std::ptr::null(),
        create_flags: xr::SessionCreateFlags::EMPTY,
        system_id: xr::SystemId::from_raw(1),
    }
}

fn software_resolver() -> Box<dyn ApplicationDeviceResolver> {
    Box::new(|_: &xr::SessionCreateInfo| -> LayerResult<Arc<dyn GraphicsDevice>> { Ok(software_device(7)) })
}

fn failing_resolver() -> Box<dyn ApplicationDeviceResolver> {
    Box::new(|_: &xr::SessionCreateInfo| -> LayerResult<Arc<dyn GraphicsDevice>> {
        Err(LayerError::Configuration("application graphics API is not supported".to_string()))
    })
}

fn factory(
    context: &LayerContext,
    runtime: &Arc<MockRuntime>,
    resolver: Box<dyn ApplicationDeviceResolver>,
) -> Arc<CompositionFrameworkFactory> {
    context
        .create_factory(Arc::new(InterceptionRegistry::default()), runtime.clone(), resolver)
        .unwrap()
}

fn framework(runtime: &Arc<MockRuntime>, settings: LayerSettings) -> CompositionFramework {
    let session = runtime
        .create_session(xr::Instance::from_raw(1), &session_info())
        .unwrap();
    CompositionFramework::new(session, runtime.clone(), software_device(7), settings).unwrap()
}

#[test]
fn test_second_factory_is_rejected() {
    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let first = factory(&context, &runtime, software_resolver());

    let err = context
        .create_factory(Arc::new(InterceptionRegistry::default()), runtime.clone(), software_resolver())
        .err()
        .unwrap();
    assert!(matches!(err, LayerError::DuplicateInstance));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.to_string(), "duplicate factory");

    drop(first);
    assert!(!context.has_factory());
    assert!(context
        .create_factory(Arc::new(InterceptionRegistry::default()), runtime, software_resolver())
        .is_ok());
}

#[test]
fn test_factory_claim_belongs_to_its_context() {
    let runtime = Arc::new(MockRuntime::new());
    let first = LayerContext::new();
    let second = LayerContext::new();
    let _a = factory(&first, &runtime, software_resolver());
    let _b = factory(&second, &runtime, software_resolver());
    assert!(first.has_factory());
    assert!(second.has_factory());
    assert!(matches!(
        first.create_factory(Arc::new(InterceptionRegistry::default()), runtime.clone(), software_resolver()),
        Err(LayerError::DuplicateInstance)
    ));
}

#[test]
fn test_session_lifecycle() {
    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let factory = factory(&context, &runtime, software_resolver());

    let session = factory
        .create_session(xr::Instance::from_raw(1), &session_info())
        .unwrap();
    assert_eq!(factory.session_count(), 1);

    let framework = factory.get_composition_framework(session).unwrap();
    assert_eq!(framework.session(), session);
    assert_eq!(framework.sharing_strategy(), SharingStrategy::ZeroCopy);
    drop(framework);

    factory.destroy_session(session).unwrap();
    assert_eq!(factory.session_count(), 0);
    assert_eq!(runtime.live_sessions(), 0);

    let err = factory.get_composition_framework(session).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_lookup_before_creation_is_not_found() {
    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let factory = factory(&context, &runtime, software_resolver());
    assert!(matches!(
        factory.get_composition_framework(xr::Session::from_raw(42)),
        Err(LayerError::NotFound(_))
    ));
}

#[test]
fn test_failed_framework_destroys_session() {
    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let factory = factory(&context, &runtime, failing_resolver());

    let err = factory
        .create_session(xr::Instance::from_raw(1), &session_info())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(factory.session_count(), 0);
    assert_eq!(runtime.live_sessions(), 0);
}

#[test]
fn test_runtime_failure_registers_nothing() {
    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let factory = factory(&context, &runtime, software_resolver());

    runtime.fail_next_session();
    let err = factory
        .create_session(xr::Instance::from_raw(1), &session_info())
        .err()
        .unwrap();
    assert_eq!(err.to_xr_result(), xr::Result::ERROR_RUNTIME_FAILURE);
    assert_eq!(factory.session_count(), 0);
}

#[test]
fn test_concurrent_lookups_during_destroy() {
    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let factory = factory(&context, &runtime, software_resolver());
    let session = factory
        .create_session(xr::Instance::from_raw(1), &session_info())
        .unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let factory = factory.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    match factory.get_composition_framework(session) {
                        Ok(framework) => assert_eq!(framework.session(), session),
                        Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
                    }
                }
            })
        })
        .collect();

    factory.destroy_session(session).unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(factory.session_count(), 0);
}

#[test]
fn test_intercepted_functions_are_substituted() {
    unsafe extern "system" fn real() {}
    unsafe extern "system" fn replacement() {}

    let interceptions = InterceptionRegistry::default();
    interceptions.register("xrCreateSession", replacement);

    let mut function: Option<xr::pfn::VoidFunction> = Some(real);
    assert!(interceptions.resolve("xrCreateSession", &mut function));
    assert_eq!(function.map(|f| f as usize), Some(replacement as usize));
    assert_eq!(
        interceptions.real("xrCreateSession").map(|f| f as usize),
        Some(real as usize)
    );

    let mut other: Option<xr::pfn::VoidFunction> = Some(real);
    assert!(!interceptions.resolve("xrEndFrame", &mut other));
    assert_eq!(other.map(|f| f as usize), Some(real as usize));

    let mut missing: Option<xr::pfn::VoidFunction> = None;
    assert!(!interceptions.resolve("xrCreateSession", &mut missing));
}

#[test]
fn test_factory_post_hook_uses_registry() {
    unsafe extern "system" fn real() {}
    unsafe extern "system" fn replacement() {}

    let context = LayerContext::new();
    let runtime = Arc::new(MockRuntime::new());
    let interceptions = Arc::new(InterceptionRegistry::default());
    interceptions.register("xrDestroySession", replacement);
    let factory = context
        .create_factory(interceptions, runtime, software_resolver())
        .unwrap();

    let mut function: Option<xr::pfn::VoidFunction> = Some(real);
    assert!(factory.xr_get_instance_proc_addr_post("xrDestroySession", &mut function));
    assert_eq!(function.map(|f| f as usize), Some(replacement as usize));
    assert!(factory.interceptions().real("xrDestroySession").is_some());
}

#[test]
fn test_session_data_set_once() {
    #[derive(Debug, PartialEq)]
    struct Calibration(u32);

    let runtime = Arc::new(MockRuntime::new());
    let framework = framework(&runtime, LayerSettings::default());

    assert!(framework.session_data::<Calibration>().is_none());
    framework.set_session_data(Calibration(3)).unwrap();
    assert_eq!(framework.session_data::<Calibration>(), Some(&Calibration(3)));
    assert!(framework.session_data::<String>().is_none());
    assert!(matches!(
        framework.set_session_data(Calibration(4)),
        Err(LayerError::InvalidCallOrder(_))
    ));
}

#[test]
fn test_preferred_swapchain_formats() {
    let runtime = Arc::new(MockRuntime::new());
    let framework = framework(&runtime, LayerSettings::default());

    assert_eq!(framework.preferred_swapchain_format(TextureUsage::COLOR_ATTACHMENT, false), RGBA8);
    assert_eq!(framework.preferred_swapchain_format(TextureUsage::COLOR_ATTACHMENT, true), RGBA8_SRGB);
    assert_eq!(framework.preferred_swapchain_format(TextureUsage::DEPTH_STENCIL_ATTACHMENT, false), D32);
    assert_eq!(framework.preferred_swapchain_format(TextureUsage::SAMPLED, false), 0);
}

#[test]
fn test_create_swapchain_by_mode() {
    let runtime = Arc::new(MockRuntime::new());
    let settings = LayerSettings {
        swapchain_depth: 2,
        ..LayerSettings::default()
    };
    let framework = framework(&runtime, settings);
    let desc = TextureDesc::color(16, 16, RGBA8);

    let submittable = framework
        .create_swapchain(&desc, SwapchainMode::SUBMIT | SwapchainMode::WRITE)
        .unwrap();
    assert!(submittable.handle().is_ok());
    assert_eq!(runtime.live_swapchains(), 1);

    let private = framework
        .create_swapchain(&desc, SwapchainMode::READ | SwapchainMode::WRITE)
        .unwrap();
    assert!(private.handle().is_err());
    assert_eq!(private.len(), 2);
    assert_eq!(runtime.live_swapchains(), 1);

    drop(submittable);
    assert_eq!(runtime.live_swapchains(), 0);
}

#[test]
fn test_open_application_swapchain() {
    let runtime = Arc::new(MockRuntime::new());
    let framework = framework(&runtime, LayerSettings::default());
    let desc = TextureDesc::color(16, 16, RGBA8);
    let handle = runtime.add_swapchain(&desc);

    let swapchain = framework
        .open_application_swapchain(handle, &desc, SwapchainMode::READ)
        .unwrap();
    assert_eq!(swapchain.handle().unwrap(), handle);
    assert_eq!(swapchain.application_format(), RGBA8);
}

#[test]
fn test_open_application_swapchain_with_wrong_format() {
    let runtime = Arc::new(MockRuntime::new());
    let framework = framework(&runtime, LayerSettings::default());
    let handle = runtime.add_swapchain(&TextureDesc::color(16, 16, RGBA8));

    // DXGI_FORMAT_B8G8R8A8_UNORM, same extent.
    let err = framework
        .open_application_swapchain(handle, &TextureDesc::color(16, 16, 87), SwapchainMode::READ)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Import);
    assert_eq!(runtime.live_swapchains(), 1);
}

#[test]
fn test_framework_dropped_after_device_lost_mid_composition() {
    let runtime = Arc::new(MockRuntime::new());
    let session = runtime
        .create_session(xr::Instance::from_raw(1), &session_info())
        .unwrap();
    let composition = Arc::new(SoftwareDevice::new(AdapterLuid(7)));
    let framework = CompositionFramework::with_devices(
        session,
        runtime.clone(),
        software_device(7),
        composition.clone(),
        LayerSettings::default(),
    )
    .unwrap();

    let scope = framework.begin_composition().unwrap();
    composition.mark_lost();
    assert!(matches!(scope.finish(), Err(LayerError::DeviceLost(_))));
    assert!(framework.begin_composition().is_err());

    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        drop(framework);
        let _ = sender.send(());
    });
    assert!(receiver.recv_timeout(Duration::from_secs(3)).is_ok());
}

#[test]
fn test_composition_scope_barriers() {
    let runtime = Arc::new(MockRuntime::new());
    let framework = framework(&runtime, LayerSettings::default());

    let scope = framework.begin_composition().unwrap();
    assert_eq!(scope.framework().session(), framework.session());
    scope.finish().unwrap();

    // Dropped without finish: the post barrier still runs.
    {
        let _scope = framework.begin_composition().unwrap();
    }
    framework.serialize_pre_composition().unwrap();
    framework.serialize_post_composition().unwrap();
}

#[test]
fn test_cross_adapter_framework_fails_fast() {
    let runtime = Arc::new(MockRuntime::new());
    let session = runtime
        .create_session(xr::Instance::from_raw(1), &session_info())
        .unwrap();
    let result = CompositionFramework::with_devices(
        session,
        runtime.clone(),
        software_device(7),
        software_device(8),
        LayerSettings::default(),
    );
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Import));
}

#[test]
fn test_projection_renderer_matches_composition_device() {
    let runtime = Arc::new(MockRuntime::new());
    let framework = framework(&runtime, LayerSettings::default());
    let renderer = framework.create_projection_renderer().unwrap();
    assert_eq!(renderer.api(), framework.composition_device().api());
}
