use std::ffi::c_void;

use parking_lot::Mutex;
use tracing::{debug, info};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{GENERIC_ALL, HANDLE, LUID};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11Device5, ID3D11DeviceContext4, ID3D11Fence, ID3D11Texture2D,
    D3D11_BIND_DEPTH_STENCIL, D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_UNORDERED_ACCESS,
    D3D11_BOX, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_FENCE_FLAG_NONE, D3D11_FENCE_FLAG_SHARED,
    D3D11_RESOURCE_MISC_SHARED, D3D11_RESOURCE_MISC_SHARED_NTHANDLE, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter, IDXGIDevice, IDXGIFactory1, IDXGIResource1, DXGI_ERROR_NOT_FOUND,
    DXGI_SHARED_RESOURCE_READ, DXGI_SHARED_RESOURCE_WRITE,
};

use crate::projection::{ProjectionPass, SharpenPass};
use crate::resources::{Fence, SharedHandle, Texture};
use crate::{D3D11Error, Result};

/// Extent, format (DXGI_FORMAT value) and bindings of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: u32,
    pub render_target: bool,
    pub depth_stencil: bool,
    pub shader_resource: bool,
    pub unordered_access: bool,
}

impl TextureInfo {
    fn bind_flags(&self) -> u32 {
        let mut flags = 0;
        if self.render_target {
            flags |= D3D11_BIND_RENDER_TARGET.0 as u32;
        }
        if self.depth_stencil {
            flags |= D3D11_BIND_DEPTH_STENCIL.0 as u32;
        }
        if self.shader_resource {
            flags |= D3D11_BIND_SHADER_RESOURCE.0 as u32;
        }
        if self.unordered_access {
            flags |= D3D11_BIND_UNORDERED_ACCESS.0 as u32;
        }
        flags
    }

    fn from_desc(desc: &D3D11_TEXTURE2D_DESC) -> Self {
        let bind = desc.BindFlags;
        Self {
            width: desc.Width,
            height: desc.Height,
            array_size: desc.ArraySize,
            mip_levels: desc.MipLevels,
            sample_count: desc.SampleDesc.Count,
            format: desc.Format.0 as u32,
            render_target: bind & D3D11_BIND_RENDER_TARGET.0 as u32 != 0,
            depth_stencil: bind & D3D11_BIND_DEPTH_STENCIL.0 as u32 != 0,
            shader_resource: bind & D3D11_BIND_SHADER_RESOURCE.0 as u32 != 0,
            unordered_access: bind & D3D11_BIND_UNORDERED_ACCESS.0 as u32 != 0,
        }
    }

    pub(crate) fn subresource(&self, layer: u32) -> u32 {
        layer * self.mip_levels
    }
}

/// A D3D11 device and its immediate context.
///
/// The context is not thread-safe and is only touched under the lock.
pub struct Device {
    device: ID3D11Device5,
    context: Mutex<ID3D11DeviceContext4>,
    luid: u64,
}

// SAFETY: the device is free-threaded and the context is behind a mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Wrap an `ID3D11Device*` owned by the caller. Takes a new reference.
    ///
    /// # Safety
    /// `device` must point to a live `ID3D11Device`.
    pub unsafe fn from_raw(device: *mut c_void) -> Result<Self> {
        let device = ID3D11Device::from_raw_borrowed(&device)
            .ok_or(D3D11Error::NullPointer("ID3D11Device"))?
            .clone();
        Self::from_device(device)
    }

    /// Create a device on the adapter identified by `luid`.
    pub fn create_on_adapter(luid: u64) -> Result<Self> {
        let adapter = find_adapter(luid)?;
        let mut device: Option<ID3D11Device> = None;
        unsafe {
            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&[D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                None,
            )?;
        }
        let device = device.ok_or(D3D11Error::NullPointer("D3D11CreateDevice"))?;
        info!("Created D3D11 composition device on adapter {:016x}", luid);
        Self::from_device(device)
    }

    fn from_device(device: ID3D11Device) -> Result<Self> {
        let luid = adapter_luid(&device)?;
        let device5: ID3D11Device5 = device.cast().map_err(|_| D3D11Error::MissingInterface("ID3D11Device5"))?;
        let context = unsafe { device.GetImmediateContext()? };
        let context4: ID3D11DeviceContext4 = context
            .cast()
            .map_err(|_| D3D11Error::MissingInterface("ID3D11DeviceContext4"))?;
        Ok(Self {
            device: device5,
            context: Mutex::new(context4),
            luid,
        })
    }

    pub fn luid(&self) -> u64 {
        self.luid
    }

    pub fn raw(&self) -> &ID3D11Device5 {
        &self.device
    }

    pub(crate) fn context(&self) -> parking_lot::MutexGuard<'_, ID3D11DeviceContext4> {
        self.context.lock()
    }

    pub fn create_texture(&self, info: &TextureInfo, shareable: bool) -> Result<Texture> {
        let misc = if shareable {
            (D3D11_RESOURCE_MISC_SHARED.0 | D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0) as u32
        } else {
            0
        };
        let desc = D3D11_TEXTURE2D_DESC {
            Width: info.width,
            Height: info.height,
            MipLevels: info.mip_levels,
            ArraySize: info.array_size,
            Format: DXGI_FORMAT(info.format as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: info.sample_count,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: info.bind_flags(),
            CPUAccessFlags: 0,
            MiscFlags: misc,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture))? };
        let texture = texture.ok_or(D3D11Error::NullPointer("CreateTexture2D"))?;

        let shared = if shareable {
            let resource: IDXGIResource1 = texture.cast()?;
            let handle = unsafe {
                resource.CreateSharedHandle(
                    None,
                    DXGI_SHARED_RESOURCE_READ | DXGI_SHARED_RESOURCE_WRITE,
                    PCWSTR::null(),
                )?
            };
            Some(SharedHandle::new(handle))
        } else {
            None
        };

        debug!(
            "Created {}x{}x{} texture (format {}, shared: {})",
            info.width, info.height, info.array_size, info.format, shareable
        );
        Ok(Texture {
            texture,
            info: *info,
            shared,
        })
    }

    /// Open a texture shared by another device. The handle stays owned by the producer.
    pub fn open_texture(&self, handle: HANDLE) -> Result<Texture> {
        let texture: ID3D11Texture2D = unsafe { self.device.OpenSharedResource1(handle)? };
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        Ok(Texture {
            texture,
            info: TextureInfo::from_desc(&desc),
            shared: None,
        })
    }

    /// Wrap an `ID3D11Texture2D*` owned by someone else.
    ///
    /// `info` carries the typed format views are created with, which may
    /// differ from a typeless storage format.
    ///
    /// # Safety
    /// `texture` must point to a live `ID3D11Texture2D` of this device.
    pub unsafe fn wrap_texture(&self, texture: *mut c_void, info: &TextureInfo) -> Result<Texture> {
        let texture = ID3D11Texture2D::from_raw_borrowed(&texture)
            .ok_or(D3D11Error::NullPointer("ID3D11Texture2D"))?
            .clone();
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        texture.GetDesc(&mut desc);
        let actual = TextureInfo::from_desc(&desc);
        Ok(Texture {
            texture,
            info: TextureInfo {
                format: info.format,
                ..actual
            },
            shared: None,
        })
    }

    pub fn create_fence(&self, shareable: bool) -> Result<Fence> {
        let flags = if shareable {
            D3D11_FENCE_FLAG_SHARED
        } else {
            D3D11_FENCE_FLAG_NONE
        };
        let fence: ID3D11Fence = unsafe { self.device.CreateFence(0, flags)? };
        let shared = if shareable {
            let handle = unsafe { fence.CreateSharedHandle(None, GENERIC_ALL.0, PCWSTR::null())? };
            Some(SharedHandle::new(handle))
        } else {
            None
        };
        Ok(Fence { fence, shared })
    }

    pub fn open_fence(&self, handle: HANDLE) -> Result<Fence> {
        let fence: ID3D11Fence = unsafe { self.device.OpenSharedFence(handle)? };
        Ok(Fence { fence, shared: None })
    }

    /// Queue a signal and submit it.
    pub fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        let context = self.context();
        unsafe {
            context.Signal(&fence.fence, value)?;
            context.Flush();
        }
        Ok(())
    }

    /// Make this device's queue wait for `value`.
    pub fn wait(&self, fence: &Fence, value: u64) -> Result<()> {
        unsafe { self.context().Wait(&fence.fence, value)? };
        Ok(())
    }

    /// Copy the common layers and region of `from` into `to`, resolving
    /// multisampled sources.
    pub fn copy(&self, from: &Texture, to: &Texture) -> Result<()> {
        let layers = from.info.array_size.min(to.info.array_size);
        let context = self.context();
        unsafe {
            if from.info.sample_count > 1 && to.info.sample_count == 1 {
                for layer in 0..layers {
                    context.ResolveSubresource(
                        &to.texture,
                        to.info.subresource(layer),
                        &from.texture,
                        from.info.subresource(layer),
                        DXGI_FORMAT(to.info.format as i32),
                    );
                }
            } else {
                let region = D3D11_BOX {
                    left: 0,
                    top: 0,
                    front: 0,
                    right: from.info.width.min(to.info.width),
                    bottom: from.info.height.min(to.info.height),
                    back: 1,
                };
                for layer in 0..layers {
                    context.CopySubresourceRegion(
                        &to.texture,
                        to.info.subresource(layer),
                        0,
                        0,
                        0,
                        &from.texture,
                        from.info.subresource(layer),
                        Some(&region),
                    );
                }
            }
        }
        Ok(())
    }

    pub fn create_projection_pass(&self) -> Result<ProjectionPass> {
        ProjectionPass::new(self)
    }

    pub fn create_sharpen_pass(&self) -> Result<SharpenPass> {
        SharpenPass::new(self)
    }
}

fn luid_value(luid: LUID) -> u64 {
    ((luid.HighPart as u32 as u64) << 32) | luid.LowPart as u64
}

fn adapter_luid(device: &ID3D11Device) -> Result<u64> {
    let dxgi: IDXGIDevice = device.cast()?;
    let desc = unsafe { dxgi.GetAdapter()?.GetDesc()? };
    Ok(luid_value(desc.AdapterLuid))
}

fn find_adapter(luid: u64) -> Result<IDXGIAdapter> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1()? };
    let mut index = 0;
    loop {
        let adapter = match unsafe { factory.EnumAdapters1(index) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => return Err(D3D11Error::AdapterNotFound(luid)),
            Err(e) => return Err(e.into()),
        };
        let desc = unsafe { adapter.GetDesc1()? };
        if luid_value(desc.AdapterLuid) == luid {
            return Ok(adapter.cast()?);
        }
        index += 1;
    }
}
