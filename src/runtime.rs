//! Boundary to the underlying OpenXR runtime.
//!
//! [`RuntimeDispatch`] is the small set of runtime entry points the
//! composition core calls: session creation and teardown, swapchain
//! management and format enumeration. [`OpenXrDispatch`] implements it with
//! the function pointers of the next layer in the chain.

use std::ffi::{c_void, CStr};
use std::ptr;
use std::sync::Arc;

use openxr_sys as xr;
use parking_lot::RwLock;

use crate::composition::InterceptionRegistry;
use crate::error::{check_xr, LayerError, LayerResult};
use crate::graphics::{GraphicsApi, GraphicsDevice, GraphicsTexture, TextureDesc};

/// Entry points of the underlying runtime used by the composition core.
pub trait RuntimeDispatch: Send + Sync {
    /// Forward session creation to the runtime.
    fn create_session(&self, instance: xr::Instance, info: &xr::SessionCreateInfo) -> LayerResult<xr::Session>;

    fn destroy_session(&self, session: xr::Session) -> LayerResult<()>;

    fn enumerate_swapchain_formats(&self, session: xr::Session) -> LayerResult<Vec<i64>>;

    fn create_swapchain(&self, session: xr::Session, desc: &TextureDesc) -> LayerResult<xr::Swapchain>;

    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> LayerResult<()>;

    /// Wrap the runtime's images of `swapchain` as textures of `device`.
    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        device: &dyn GraphicsDevice,
        desc: &TextureDesc,
    ) -> LayerResult<Vec<Arc<dyn GraphicsTexture>>>;

    fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<u32>;

    fn wait_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<()>;

    fn release_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<()>;
}

/// `XrGraphicsBindingD3D11KHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GraphicsBindingD3D11 {
    pub ty: xr::StructureType,
    pub next: *const c_void,
    pub device: *mut c_void,
}

/// `XrSwapchainImageD3D11KHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SwapchainImageD3D11 {
    pub ty: xr::StructureType,
    pub next: *mut c_void,
    pub texture: *mut c_void,
}

/// Find the D3D11 graphics binding in a session create info chain.
///
/// # Safety
/// `info.next` must be a valid OpenXR structure chain.
pub unsafe fn find_d3d11_binding(info: &xr::SessionCreateInfo) -> Option<GraphicsBindingD3D11> {
    let mut next = info.next as *const xr::BaseInStructure;
    while !next.is_null() {
        if (*next).ty == xr::StructureType::GRAPHICS_BINDING_D3D11_KHR {
            return Some(*(next as *const GraphicsBindingD3D11));
        }
        next = (*next).next;
    }
    None
}

/// Swapchain entry points resolved from the next layer.
#[derive(Clone, Copy)]
struct SwapchainFunctions {
    enumerate_swapchain_formats: xr::pfn::EnumerateSwapchainFormats,
    create_swapchain: xr::pfn::CreateSwapchain,
    destroy_swapchain: xr::pfn::DestroySwapchain,
    enumerate_swapchain_images: xr::pfn::EnumerateSwapchainImages,
    acquire_swapchain_image: xr::pfn::AcquireSwapchainImage,
    wait_swapchain_image: xr::pfn::WaitSwapchainImage,
    release_swapchain_image: xr::pfn::ReleaseSwapchainImage,
}

impl SwapchainFunctions {
    fn load(instance: xr::Instance, get_instance_proc_addr: xr::pfn::GetInstanceProcAddr) -> LayerResult<Self> {
        unsafe fn resolve<F: Copy>(
            instance: xr::Instance,
            get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
            name: &'static CStr,
        ) -> LayerResult<F> {
            let mut function: Option<xr::pfn::VoidFunction> = None;
            check_xr("xrGetInstanceProcAddr", get_instance_proc_addr(instance, name.as_ptr(), &mut function))?;
            let function = function
                .ok_or_else(|| LayerError::Configuration(format!("runtime does not provide {:?}", name)))?;
            Ok(std::mem::transmute_copy::<xr::pfn::VoidFunction, F>(&function))
        }

        unsafe {
            Ok(Self {
                enumerate_swapchain_formats: resolve(instance, get_instance_proc_addr, c"xrEnumerateSwapchainFormats")?,
                create_swapchain: resolve(instance, get_instance_proc_addr, c"xrCreateSwapchain")?,
                destroy_swapchain: resolve(instance, get_instance_proc_addr, c"xrDestroySwapchain")?,
                enumerate_swapchain_images: resolve(instance, get_instance_proc_addr, c"xrEnumerateSwapchainImages")?,
                acquire_swapchain_image: resolve(instance, get_instance_proc_addr, c"xrAcquireSwapchainImage")?,
                wait_swapchain_image: resolve(instance, get_instance_proc_addr, c"xrWaitSwapchainImage")?,
                release_swapchain_image: resolve(instance, get_instance_proc_addr, c"xrReleaseSwapchainImage")?,
            })
        }
    }
}

/// [`RuntimeDispatch`] over the next layer's function pointers.
///
/// Session entry points come from the interception registry (the real
/// implementations it recorded). Swapchain entry points are resolved through
/// `xrGetInstanceProcAddr` on the first session creation.
pub struct OpenXrDispatch {
    get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
    interceptions: Arc<InterceptionRegistry>,
    functions: RwLock<Option<SwapchainFunctions>>,
}

impl OpenXrDispatch {
    pub fn new(get_instance_proc_addr: xr::pfn::GetInstanceProcAddr, interceptions: Arc<InterceptionRegistry>) -> Self {
        Self {
            get_instance_proc_addr,
            interceptions,
            functions: RwLock::new(None),
        }
    }

    fn functions(&self) -> LayerResult<SwapchainFunctions> {
        (*self.functions.read())
            .ok_or_else(|| LayerError::InvalidCallOrder("swapchain functions used before session creation".to_string()))
    }

    fn real<F: Copy>(&self, name: &str) -> LayerResult<F> {
        let function = self
            .interceptions
            .real(name)
            .ok_or_else(|| LayerError::InvalidCallOrder(format!("{} was never resolved", name)))?;
        Ok(unsafe { std::mem::transmute_copy::<xr::pfn::VoidFunction, F>(&function) })
    }
}

impl RuntimeDispatch for OpenXrDispatch {
    fn create_session(&self, instance: xr::Instance, info: &xr::SessionCreateInfo) -> LayerResult<xr::Session> {
        if self.functions.read().is_none() {
            let loaded = SwapchainFunctions::load(instance, self.get_instance_proc_addr)?;
            *self.functions.write() = Some(loaded);
        }

        let create_session: xr::pfn::CreateSession = self.real("xrCreateSession")?;
        let mut session = xr::Session::NULL;
        check_xr("xrCreateSession", unsafe { create_session(instance, info, &mut session) })?;
        Ok(session)
    }

    fn destroy_session(&self, session: xr::Session) -> LayerResult<()> {
        let destroy_session: xr::pfn::DestroySession = self.real("xrDestroySession")?;
        check_xr("xrDestroySession", unsafe { destroy_session(session) })
    }

    fn enumerate_swapchain_formats(&self, session: xr::Session) -> LayerResult<Vec<i64>> {
        let functions = self.functions()?;
        let mut count = 0u32;
        unsafe {
            check_xr(
                "xrEnumerateSwapchainFormats",
                (functions.enumerate_swapchain_formats)(session, 0, &mut count, ptr::null_mut()),
            )?;
            let mut formats = vec![0i64; count as usize];
            check_xr(
                "xrEnumerateSwapchainFormats",
                (functions.enumerate_swapchain_formats)(session, count, &mut count, formats.as_mut_ptr()),
            )?;
            formats.truncate(count as usize);
            Ok(formats)
        }
    }

    fn create_swapchain(&self, session: xr::Session, desc: &TextureDesc) -> LayerResult<xr::Swapchain> {
        let functions = self.functions()?;
        let info = xr::SwapchainCreateInfo {
            ty: xr::SwapchainCreateInfo::TYPE,
            next: ptr::null(),
            create_flags: xr::SwapchainCreateFlags::EMPTY,
            usage_flags: xr::SwapchainUsageFlags::from_raw(desc.usage.bits()),
            format: desc.format,
            sample_count: desc.sample_count,
            width: desc.width,
            height: desc.height,
            face_count: 1,
            array_size: desc.array_size,
            mip_count: desc.mip_count,
        };
        let mut swapchain = xr::Swapchain::NULL;
        check_xr("xrCreateSwapchain", unsafe {
            (functions.create_swapchain)(session, &info, &mut swapchain)
        })?;
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> LayerResult<()> {
        let functions = self.functions()?;
        check_xr("xrDestroySwapchain", unsafe { (functions.destroy_swapchain)(swapchain) })
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        device: &dyn GraphicsDevice,
        desc: &TextureDesc,
    ) -> LayerResult<Vec<Arc<dyn GraphicsTexture>>> {
        if device.api() != GraphicsApi::D3D11 {
            return Err(LayerError::Configuration(format!(
                "runtime swapchain images cannot be wrapped for {} devices",
                device.api()
            )));
        }

        let functions = self.functions()?;
        let mut count = 0u32;
        let images = unsafe {
            check_xr(
                "xrEnumerateSwapchainImages",
                (functions.enumerate_swapchain_images)(swapchain, 0, &mut count, ptr::null_mut()),
            )?;
            let mut images = vec![
                SwapchainImageD3D11 {
                    ty: xr::StructureType::SWAPCHAIN_IMAGE_D3D11_KHR,
                    next: ptr::null_mut(),
                    texture: ptr::null_mut(),
                };
                count as usize
            ];
            check_xr(
                "xrEnumerateSwapchainImages",
                (functions.enumerate_swapchain_images)(
                    swapchain,
                    count,
                    &mut count,
                    images.as_mut_ptr() as *mut xr::SwapchainImageBaseHeader,
                ),
            )?;
            images.truncate(count as usize);
            images
        };

        images
            .iter()
            .map(|image| device.wrap_native_texture(image.texture as usize, desc))
            .collect()
    }

    fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<u32> {
        let functions = self.functions()?;
        let mut index = 0u32;
        check_xr("xrAcquireSwapchainImage", unsafe {
            (functions.acquire_swapchain_image)(swapchain, ptr::null(), &mut index)
        })?;
        Ok(index)
    }

    fn wait_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<()> {
        let functions = self.functions()?;
        let info = xr::SwapchainImageWaitInfo {
            ty: xr::SwapchainImageWaitInfo::TYPE,
            next: ptr::null(),
            timeout: xr::Duration::INFINITE,
        };
        check_xr("xrWaitSwapchainImage", unsafe {
            (functions.wait_swapchain_image)(swapchain, &info)
        })
    }

    fn release_swapchain_image(&self, swapchain: xr::Swapchain) -> LayerResult<()> {
        let functions = self.functions()?;
        check_xr("xrReleaseSwapchainImage", unsafe {
            (functions.release_swapchain_image)(swapchain, ptr::null())
        })
    }
}
