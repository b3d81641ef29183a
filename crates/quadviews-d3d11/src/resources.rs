use std::ffi::c_void;

use tracing::warn;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D11::{ID3D11Fence, ID3D11Texture2D};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::device::TextureInfo;
use crate::{D3D11Error, Result};

/// NT handle to a shared texture or fence, closed on drop.
///
/// Consumers open the resource through [`SharedHandle::raw`] and never close it.
#[derive(Debug)]
pub struct SharedHandle(HANDLE);

// SAFETY: an NT handle is a process-wide kernel object reference.
unsafe impl Send for SharedHandle {}
unsafe impl Sync for SharedHandle {}

impl SharedHandle {
    pub(crate) fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }

    pub fn value(&self) -> u64 {
        self.0 .0 as usize as u64
    }

    pub fn from_value(value: u64) -> HANDLE {
        HANDLE(value as usize as *mut c_void)
    }
}

impl Drop for SharedHandle {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            warn!("Failed to close shared handle: {}", e);
        }
    }
}

/// A 2D texture (array) on one device.
pub struct Texture {
    pub(crate) texture: ID3D11Texture2D,
    pub(crate) info: TextureInfo,
    pub(crate) shared: Option<SharedHandle>,
}

// SAFETY: D3D11 resources are free-threaded; only device contexts are not.
unsafe impl Send for Texture {}
unsafe impl Sync for Texture {}

impl Texture {
    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    pub fn raw(&self) -> &ID3D11Texture2D {
        &self.texture
    }

    pub fn shared_handle(&self) -> Option<&SharedHandle> {
        self.shared.as_ref()
    }

    /// Create views with `format`, a typed member of the storage format's family.
    pub fn with_view_format(mut self, format: u32) -> Self {
        self.info.format = format;
        self
    }
}

/// A monitored fence, signalled and waited on through a device context.
pub struct Fence {
    pub(crate) fence: ID3D11Fence,
    pub(crate) shared: Option<SharedHandle>,
}

// SAFETY: ID3D11Fence is free-threaded.
unsafe impl Send for Fence {}
unsafe impl Sync for Fence {}

impl Fence {
    pub fn raw(&self) -> &ID3D11Fence {
        &self.fence
    }

    pub fn shared_handle(&self) -> Option<&SharedHandle> {
        self.shared.as_ref()
    }

    pub fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    /// Block the calling thread until the fence reaches `value`.
    pub fn wait_on_cpu(&self, value: u64) -> Result<()> {
        if self.completed_value() >= value {
            return Ok(());
        }
        unsafe {
            let event = CreateEventW(None, false, false, None)?;
            let result = self
                .fence
                .SetEventOnCompletion(value, event)
                .map_err(D3D11Error::from)
                .and_then(|()| {
                    if WaitForSingleObject(event, INFINITE) == WAIT_OBJECT_0 {
                        Ok(())
                    } else {
                        Err(D3D11Error::FenceWait(value))
                    }
                });
            let _ = CloseHandle(event);
            result
        }
    }
}
