//! Scripted runtime for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use openxr_sys as xr;
use parking_lot::Mutex;

use crate::error::{LayerError, LayerResult};
use crate::graphics::{AdapterLuid, GraphicsDevice, GraphicsTexture, SoftwareDevice, TextureDesc};
use crate::runtime::RuntimeDispatch;

/// DXGI_FORMAT_R8G8B8A8_UNORM
pub const RGBA8: i64 = 28;
/// DXGI_FORMAT_R8G8B8A8_UNORM_SRGB
pub const RGBA8_SRGB: i64 = 29;
/// DXGI_FORMAT_D32_FLOAT
pub const D32: i64 = 40;

pub fn software_device(luid: u64) -> Arc<dyn GraphicsDevice> {
    Arc::new(SoftwareDevice::new(AdapterLuid(luid)))
}

#[derive(Default)]
struct MockSwapchain {
    desc: Option<TextureDesc>,
    images: Vec<Arc<dyn GraphicsTexture>>,
    next: u32,
    acquired: VecDeque<u32>,
    released: Vec<u32>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    sessions: HashSet<u64>,
    swapchains: HashMap<u64, MockSwapchain>,
    destroyed_swapchains: Vec<u64>,
    fail_next_session: bool,
    fail_next_wait: bool,
}

/// In-memory runtime whose swapchain images live on the device they are
/// enumerated for.
pub struct MockRuntime {
    state: Mutex<MockState>,
    image_count: u32,
    shareable_images: bool,
    formats: Vec<i64>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_images(3, true)
    }

    /// Runtime whose swapchains have `image_count` images, shareable or not.
    pub fn with_images(image_count: u32, shareable_images: bool) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                ..Default::default()
            }),
            image_count,
            shareable_images,
            formats: vec![RGBA8_SRGB, RGBA8, D32],
        }
    }

    /// Make the next session creation fail.
    pub fn fail_next_session(&self) {
        self.state.lock().fail_next_session = true;
    }

    /// Make the next swapchain image wait fail.
    pub fn fail_next_wait(&self) {
        self.state.lock().fail_next_wait = true;
    }

    fn next_handle(state: &mut MockState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    /// Indices released to the runtime so far, in order.
    pub fn released(&self, swapchain: xr::Swapchain) -> Vec<u32> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.into_raw())
            .map(|s| s.released.clone())
            .unwrap_or_default()
    }

    pub fn destroyed_swapchains(&self) -> Vec<u64> {
        self.state.lock().destroyed_swapchains.clone()
    }

    /// Add a swapchain as if the application had created it directly.
    pub fn add_swapchain(&self, desc: &TextureDesc) -> xr::Swapchain {
        let mut state = self.state.lock();
        let handle = Self::next_handle(&mut state);
        state.swapchains.insert(
            handle,
            MockSwapchain {
                desc: Some(*desc),
                ..Default::default()
            },
        );
        xr::Swapchain::from_raw(handle)
    }

    fn runtime_error(call: &'static str, result: xr::Result) -> LayerError {
        LayerError::Runtime { call, result }
    }
}

impl RuntimeDispatch for MockRuntime {
    fn create_session(&self, _instance: xr::Instance, _info: &xr::SessionCreateInfo) -> LayerResult<xr::Session> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_session) {
            return Err(Self::runtime_error("xrCreateSession", xr::Result::ERROR_RUNTIME_FAILURE));
        }
        let handle = Self::next_handle(&mut state);
        state.sessions.insert(handle);
        Ok(xr::Session::from_raw(handle))
    }

    fn destroy_session(&self, session: xr::Session) -> LayerResult<()> {
        if self.state.lock().sessions.remove(&session.into_raw()) {
            Ok(())
        } else {
            Err(Self::runtime_error("xrDestroySession", xr::Result::ERROR_HANDLE_INVALID))
        }
    }

    fn enumerate_swapchain_formats(&self, _session: xr::Session) -> LayerResult<Vec<i64>> {
        Ok(self.formats.clone())
    }

    fn create_swapchain(&self, session: xr::Session, desc: &TextureDesc) -> LayerResult<xr::Swapchain> {
        let mut state = self.state.lock();
        if !state.sessions.contains(&session.into_raw()) {
            return Err(Self::runtime_error("xrCreateSwapchain", xr::Result::ERROR_HANDLE_INVALID));
        }
        if !self.formats.contains(&desc.format) {
            return Err(Self::runtime_error(
                "xrCreateSwapchain",
                xr::Result::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED,
            ));
        }
        let handle = Self::next_handle(&mut state);
        state.swapchains.insert(
            handle,
            MockSwapchain {
                desc: Some(*desc),
                ..Default::default()
            },
        );
        Ok(xr::Swapchain::from_raw(handle))
    }

    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> LayerResult<()> {
        let mut state = self.state.lock();
        state
            .swapchains
            .remove(&swapchain.into_raw())
            .ok_or_else(|| Self::runtime_error("xrDestroySwapchain", xr::Result::ERROR_HANDLE_INVALID))?;
        state.destroyed_swapchains.push(swapchain.into_raw());
        Ok(())
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        device: &dyn GraphicsDevice,
        desc: &TextureDesc,
    ) -> LayerResult<Vec<Arc<dyn GraphicsTexture>>> {
        let mut state = self.state.lock();
        let entry = state
            .swapchains
            .get_mut(&swapchain.into_raw())
            .ok_or_else(|| Self::runtime_error("xrEnumerateSwapchainImages", xr::Result::ERROR_HANDLE_INVALID))?;
        if entry.images.is_empty() {
            let desc = entry.desc.unwrap_or(*desc);
            for _ in 0..self.image_count {
                entry.images.push(device.create_texture(&desc, self.shareable_images)?);
            }
        }
        Ok(entry.images.clone())
    }

    fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<u32> {
        let mut state = self.state.lock();
        let entry = state
            .swapchains
            .get_mut(&swapchain.into_raw())
            .ok_or_else(|| Self::runtime_error("xrAcquireSwapchainImage", xr::Result::ERROR_HANDLE_INVALID))?;
        let index = entry.next;
        if entry.acquired.contains(&index) {
            return Err(Self::runtime_error(
                "xrAcquireSwapchainImage",
                xr::Result::ERROR_CALL_ORDER_INVALID,
            ));
        }
        entry.acquired.push_back(index);
        entry.next = (index + 1) % self.image_count;
        Ok(index)
    }

    fn wait_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_wait) {
            return Err(Self::runtime_error("xrWaitSwapchainImage", xr::Result::ERROR_RUNTIME_FAILURE));
        }
        let entry = state
            .swapchains
            .get(&swapchain.into_raw())
            .ok_or_else(|| Self::runtime_error("xrWaitSwapchainImage", xr::Result::ERROR_HANDLE_INVALID))?;
        if entry.acquired.is_empty() {
            return Err(Self::runtime_error("xrWaitSwapchainImage", xr::Result::ERROR_CALL_ORDER_INVALID));
        }
        Ok(())
    }

    fn release_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .swapchains
            .get_mut(&swapchain.into_raw())
            .ok_or_else(|| Self::runtime_error("xrReleaseSwapchainImage", xr::Result::ERROR_HANDLE_INVALID))?;
        let index = entry.acquired.pop_front().ok_or_else(|| {
            Self::runtime_error("xrReleaseSwapchainImage", xr::Result::ERROR_CALL_ORDER_INVALID)
        })?;
        entry.released.push(index);
        Ok(())
    }
}
