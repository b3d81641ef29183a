use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openxr_sys as xr;

use super::*;
use crate::error::{ErrorKind, LayerError};
use crate::graphics::{
    downcast_texture, AdapterLuid, GraphicsApi, SharingStrategy, SoftwareDevice, SoftwareTexture, TextureDesc,
};
use crate::runtime::RuntimeDispatch;
use crate::testing::{software_device, MockRuntime, RGBA8};

struct Fixture {
    runtime: Arc<MockRuntime>,
    session: xr::Session,
    application: Arc<dyn GraphicsDevice>,
    composition: Arc<dyn GraphicsDevice>,
}

impl Fixture {
    fn new(runtime: MockRuntime) -> Self {
        let runtime = Arc::new(runtime);
        let info = xr::SessionCreateInfo {
            ty: xr::SessionCreateInfo::TYPE,
            next: std::ptr::null(),
            create_flags: xr::SessionCreateFlags::EMPTY,
            system_id: xr::SystemId::from_raw(1),
        };
        let session = runtime.create_session(xr::Instance::from_raw(1), &info).unwrap();
        let application = software_device(7);
        let composition = application.create_composition_device().unwrap();
        Self {
            runtime,
            session,
            application,
            composition,
        }
    }

    fn strategy(&self) -> SharingStrategy {
        SharingStrategy::select(self.application.as_ref(), self.composition.as_ref())
    }

    fn create(&self, mode: SwapchainMode) -> SubmittableSwapchain {
        SubmittableSwapchain::create(
            self.runtime.clone(),
            self.session,
            self.application.clone(),
            self.composition.clone(),
            &TextureDesc::color(8, 8, RGBA8),
            mode,
            self.strategy(),
        )
        .unwrap()
    }
}

fn lose(device: &Arc<dyn GraphicsDevice>) {
    device
        .as_any()
        .downcast_ref::<SoftwareDevice>()
        .unwrap()
        .mark_lost();
}

/// Run `f` on a thread and report whether it returned within a few seconds.
fn finishes<F: FnOnce() + Send + 'static>(f: F) -> bool {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = sender.send(());
    });
    receiver.recv_timeout(Duration::from_secs(3)).is_ok()
}

fn software(texture: &Arc<dyn GraphicsTexture>) -> &SoftwareTexture {
    downcast_texture::<SoftwareTexture>(texture.as_ref(), GraphicsApi::Software).unwrap()
}

#[test]
fn test_busy_after_depth_acquires() {
    let fixture = Fixture::new(MockRuntime::with_images(3, true));
    let swapchain = fixture.create(SwapchainMode::SUBMIT);

    for expected in 0..3 {
        assert_eq!(swapchain.acquire_image(false).unwrap(), expected);
    }
    let err = swapchain.acquire_image(false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    swapchain.wait_image().unwrap();
    swapchain.release_image().unwrap();
    assert_eq!(swapchain.acquire_image(false).unwrap(), 0);
}

#[test]
fn test_private_busy_after_depth_acquires() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = PrivateSwapchain::new(
        fixture.application.as_ref(),
        fixture.composition.as_ref(),
        &TextureDesc::color(4, 4, RGBA8),
        SwapchainMode::READ | SwapchainMode::WRITE,
        2,
    )
    .unwrap();

    assert_eq!(swapchain.len(), 2);
    swapchain.acquire_image(false).unwrap();
    swapchain.acquire_image(false).unwrap();
    assert!(matches!(swapchain.acquire_image(false), Err(LayerError::Busy(_))));
    swapchain.release_image().unwrap();
    assert_eq!(swapchain.acquire_image(false).unwrap(), 0);
}

#[test]
fn test_second_wait_without_release_fails() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT);

    swapchain.acquire_image(false).unwrap();
    swapchain.wait_image().unwrap();
    assert!(matches!(swapchain.wait_image(), Err(LayerError::InvalidCallOrder(_))));
}

#[test]
fn test_blocking_acquire_waits_image() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT);

    swapchain.acquire_image(true).unwrap();
    // Already waited by the blocking acquire.
    assert!(matches!(swapchain.wait_image(), Err(LayerError::InvalidCallOrder(_))));
    swapchain.release_image().unwrap();
}

#[test]
fn test_submit_only_releases_immediately() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT);
    let handle = swapchain.handle().unwrap();

    swapchain.acquire_image(true).unwrap();
    swapchain.release_image().unwrap();
    assert_eq!(fixture.runtime.released(handle), vec![0]);
    assert!(matches!(
        swapchain.last_released_image(),
        Err(LayerError::InvalidCallOrder(_))
    ));
}

#[test]
fn test_read_release_is_deferred_until_commit() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ);
    let handle = swapchain.handle().unwrap();

    assert!(swapchain.last_released_image().unwrap().is_none());

    swapchain.acquire_image(true).unwrap();
    swapchain.release_image().unwrap();
    assert!(fixture.runtime.released(handle).is_empty());

    let image = swapchain.last_released_image().unwrap().unwrap();
    assert_eq!(image.index(), 0);

    swapchain.commit_last_released_image().unwrap();
    assert_eq!(fixture.runtime.released(handle), vec![0]);
    assert!(swapchain.last_released_image().unwrap().is_none());

    // Nothing new released: committing again changes nothing.
    swapchain.commit_last_released_image().unwrap();
    assert_eq!(fixture.runtime.released(handle), vec![0]);
}

#[test]
fn test_second_release_flushes_older_image() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ);
    let handle = swapchain.handle().unwrap();

    swapchain.acquire_image(true).unwrap();
    swapchain.release_image().unwrap();
    swapchain.acquire_image(true).unwrap();
    swapchain.release_image().unwrap();

    assert_eq!(fixture.runtime.released(handle), vec![0]);
    assert_eq!(swapchain.last_released_image().unwrap().unwrap().index(), 1);
}

#[test]
fn test_reacquiring_deferred_image_releases_it() {
    let fixture = Fixture::new(MockRuntime::with_images(1, true));
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ);
    let handle = swapchain.handle().unwrap();

    swapchain.acquire_image(true).unwrap();
    swapchain.release_image().unwrap();
    assert_eq!(swapchain.acquire_image(true).unwrap(), 0);
    assert_eq!(fixture.runtime.released(handle), vec![0]);
    assert!(swapchain.last_released_image().unwrap().is_none());
}

#[test]
fn test_zero_copy_shares_application_memory() {
    let fixture = Fixture::new(MockRuntime::with_images(2, true));
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ);
    assert!(!swapchain.uses_bounce_texture());

    swapchain.acquire_image(true).unwrap();
    let image = swapchain.image(0).unwrap();
    software(image.application_texture()).fill([0.0, 1.0, 0.0, 1.0]);
    swapchain.release_image().unwrap();

    let released = swapchain.last_released_image().unwrap().unwrap();
    assert_eq!(software(released.read_texture()).texel(0, 3, 3), [0.0, 1.0, 0.0, 1.0]);
}

#[test]
fn test_bounce_texture_round_trip() {
    let fixture = Fixture::new(MockRuntime::with_images(2, false));
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ | SwapchainMode::WRITE);
    assert!(swapchain.uses_bounce_texture());

    swapchain.acquire_image(true).unwrap();
    let image = swapchain.image(0).unwrap();
    software(image.application_texture()).fill([1.0, 0.0, 0.0, 1.0]);
    swapchain.release_image().unwrap();

    // Application contents reach the composition side through the bounce copy.
    let released = swapchain.last_released_image().unwrap().unwrap();
    assert_eq!(software(released.read_texture()).texel(0, 0, 0), [1.0, 0.0, 0.0, 1.0]);

    // Composition output is copied back before the runtime release.
    software(released.write_texture()).fill([0.0, 0.0, 1.0, 1.0]);
    swapchain.commit_last_released_image().unwrap();
    assert_eq!(software(image.application_texture()).texel(0, 5, 5), [0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn test_cross_adapter_fails_fast() {
    let fixture = Fixture::new(MockRuntime::new());
    let other_adapter = software_device(99);
    let err = SubmittableSwapchain::create(
        fixture.runtime.clone(),
        fixture.session,
        fixture.application.clone(),
        other_adapter.clone(),
        &TextureDesc::color(8, 8, RGBA8),
        SwapchainMode::SUBMIT | SwapchainMode::READ,
        SharingStrategy::select(fixture.application.as_ref(), other_adapter.as_ref()),
    )
    .err()
    .unwrap();
    assert_eq!(err.kind(), ErrorKind::Import);
    // The runtime swapchain is not leaked.
    assert_eq!(fixture.runtime.live_swapchains(), 0);
}

#[test]
fn test_drop_destroys_owned_swapchain_only() {
    let fixture = Fixture::new(MockRuntime::new());
    let owned = fixture.create(SwapchainMode::SUBMIT);
    let owned_handle = owned.handle().unwrap();
    drop(owned);
    assert_eq!(fixture.runtime.destroyed_swapchains(), vec![owned_handle.into_raw()]);

    let desc = TextureDesc::color(8, 8, RGBA8);
    let handle = fixture.runtime.add_swapchain(&desc);
    let opened = SubmittableSwapchain::open(
        fixture.runtime.clone(),
        handle,
        fixture.application.clone(),
        fixture.composition.clone(),
        &desc,
        SwapchainMode::READ,
        fixture.strategy(),
    )
    .unwrap();
    drop(opened);
    assert_eq!(fixture.runtime.live_swapchains(), 1);
}

#[test]
fn test_unsupported_format_is_runtime_error() {
    let fixture = Fixture::new(MockRuntime::new());
    let result = SubmittableSwapchain::create(
        fixture.runtime.clone(),
        fixture.session,
        fixture.application.clone(),
        fixture.composition.clone(),
        &TextureDesc::color(8, 8, 87),
        SwapchainMode::SUBMIT,
        fixture.strategy(),
    );
    assert!(matches!(result, Err(LayerError::Runtime { .. })));
}

#[test]
fn test_sub_image_covers_whole_image() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT);
    let sub_image = swapchain.sub_image().unwrap();
    assert_eq!(sub_image.swapchain, swapchain.handle().unwrap());
    assert_eq!(sub_image.image_rect.extent.width, 8);
    assert_eq!(sub_image.image_rect.extent.height, 8);

    let private = PrivateSwapchain::new(
        fixture.application.as_ref(),
        fixture.composition.as_ref(),
        &TextureDesc::color(4, 4, RGBA8),
        SwapchainMode::WRITE,
        3,
    )
    .unwrap();
    assert!(private.sub_image().is_err());
}

#[test]
fn test_private_last_released_and_commit() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = PrivateSwapchain::new(
        fixture.application.as_ref(),
        fixture.composition.as_ref(),
        &TextureDesc::color(4, 4, RGBA8),
        SwapchainMode::READ,
        3,
    )
    .unwrap();

    assert!(swapchain.last_released_image().unwrap().is_none());
    swapchain.acquire_image(true).unwrap();
    let image = swapchain.image(0).unwrap();
    software(image.application_texture()).fill([0.5, 0.5, 0.5, 1.0]);
    swapchain.release_image().unwrap();

    let released = swapchain.last_released_image().unwrap().unwrap();
    assert!(software(released.read_texture()).shares_storage_with(software(image.application_texture())));

    swapchain.commit_last_released_image().unwrap();
    swapchain.commit_last_released_image().unwrap();
    assert!(swapchain.last_released_image().unwrap().is_none());
}

#[test]
fn test_private_rejects_zero_depth() {
    let fixture = Fixture::new(MockRuntime::new());
    let result = PrivateSwapchain::new(
        fixture.application.as_ref(),
        fixture.composition.as_ref(),
        &TextureDesc::color(4, 4, RGBA8),
        SwapchainMode::READ,
        0,
    );
    assert!(matches!(result, Err(LayerError::Configuration(_))));
}

#[test]
fn test_fence_pair_orders_devices() {
    let fixture = Fixture::new(MockRuntime::new());
    let fences = FencePair::new(fixture.application.as_ref(), fixture.composition.as_ref()).unwrap();
    assert_eq!(fences.application_to_composition().unwrap(), 1);
    assert_eq!(fences.composition_to_application().unwrap(), 2);
    assert_eq!(fences.value(), 2);
    fences.drain();
}

#[test]
fn test_drain_skips_value_whose_signal_failed() {
    let application = Arc::new(SoftwareDevice::new(AdapterLuid(7)));
    let composition = Arc::new(SoftwareDevice::new(AdapterLuid(7)));
    let fences = FencePair::new(application.as_ref(), composition.as_ref()).unwrap();
    assert_eq!(fences.application_to_composition().unwrap(), 1);

    composition.mark_lost();
    assert!(matches!(
        fences.composition_to_application(),
        Err(LayerError::DeviceLost(_))
    ));
    assert_eq!(fences.value(), 2);
    assert_eq!(fences.signaled(), 1);

    assert!(finishes(move || fences.drain()));
}

#[test]
fn test_swapchain_dropped_after_lost_barrier() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ);
    swapchain.acquire_image(true).unwrap();
    swapchain.release_image().unwrap();

    lose(&fixture.composition);
    assert!(matches!(
        swapchain.last_released_image(),
        Err(LayerError::DeviceLost(_))
    ));
    assert!(matches!(
        swapchain.commit_last_released_image(),
        Err(LayerError::DeviceLost(_))
    ));

    assert!(finishes(move || drop(swapchain)));
    assert_eq!(fixture.runtime.live_swapchains(), 0);
}

#[test]
fn test_failed_wait_hands_image_back_to_runtime() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT | SwapchainMode::READ);
    let handle = swapchain.handle().unwrap();

    fixture.runtime.fail_next_wait();
    assert!(matches!(swapchain.acquire_image(true), Err(LayerError::Runtime { .. })));
    assert_eq!(fixture.runtime.released(handle), vec![0]);

    // Both rings moved on to image 1.
    assert_eq!(swapchain.acquire_image(true).unwrap(), 1);
    swapchain.release_image().unwrap();
    assert_eq!(swapchain.last_released_image().unwrap().unwrap().index(), 1);
    swapchain.commit_last_released_image().unwrap();
    assert_eq!(fixture.runtime.released(handle), vec![0, 1]);
}

#[test]
fn test_failed_acquire_behind_held_image_is_released_in_order() {
    let fixture = Fixture::new(MockRuntime::new());
    let swapchain = fixture.create(SwapchainMode::SUBMIT);
    let handle = swapchain.handle().unwrap();

    assert_eq!(swapchain.acquire_image(false).unwrap(), 0);
    fixture.runtime.fail_next_wait();
    assert!(swapchain.acquire_image(true).is_err());
    // Image 1 waits behind image 0, which the application still holds.
    assert!(fixture.runtime.released(handle).is_empty());

    swapchain.release_image().unwrap();
    assert_eq!(fixture.runtime.released(handle), vec![0, 1]);
    assert_eq!(swapchain.acquire_image(true).unwrap(), 2);
}
