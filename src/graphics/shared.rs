//! In-process share table.
//!
//! Devices without OS-level shared handles (software, wgpu) publish shareable
//! resources here. A handle stays valid while the publishing device exists;
//! dropping the device retires all of its entries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use super::{AdapterLuid, GraphicsApi, HandleKind, ShareableHandle, SharedTextureDesc};
use crate::error::{LayerError, LayerResult};

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedKind {
    Texture(SharedTextureDesc),
    Fence,
}

struct ShareEntry {
    owner: u64,
    api: GraphicsApi,
    luid: AdapterLuid,
    kind: SharedKind,
    payload: Arc<dyn Any + Send + Sync>,
}

lazy_static! {
    static ref SHARE_TABLE: Mutex<HashMap<u64, ShareEntry>> = Mutex::new(HashMap::new());
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique id for a device instance, used as the owner of its published entries.
pub fn next_device_id() -> u64 {
    NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Publish a resource and get a handle for it.
pub fn publish(
    owner: u64,
    api: GraphicsApi,
    luid: AdapterLuid,
    kind: SharedKind,
    payload: Arc<dyn Any + Send + Sync>,
) -> ShareableHandle {
    let value = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    SHARE_TABLE.lock().insert(
        value,
        ShareEntry {
            owner,
            api,
            luid,
            kind,
            payload,
        },
    );
    ShareableHandle {
        value,
        kind: HandleKind::InProcess,
    }
}

/// Resolve a texture handle for a device on `luid` using `api`.
///
/// Fails with an import error if the handle is stale, was published on
/// another adapter or API, or if `desc` does not match the allocation.
pub fn open_texture(
    handle: &ShareableHandle,
    api: GraphicsApi,
    luid: AdapterLuid,
    desc: &SharedTextureDesc,
) -> LayerResult<Arc<dyn Any + Send + Sync>> {
    let (kind, payload) = resolve(handle, api, luid)?;
    match kind {
        SharedKind::Texture(shared) if shared == *desc => Ok(payload),
        SharedKind::Texture(shared) => Err(LayerError::Import(format!(
            "descriptor mismatch for handle {}: allocated {:?}, requested {:?}",
            handle.value, shared, desc
        ))),
        SharedKind::Fence => Err(LayerError::Import(format!(
            "handle {} refers to a fence, not a texture",
            handle.value
        ))),
    }
}

/// Resolve a fence handle for a device on `luid` using `api`.
pub fn open_fence(handle: &ShareableHandle, api: GraphicsApi, luid: AdapterLuid) -> LayerResult<Arc<dyn Any + Send + Sync>> {
    let (kind, payload) = resolve(handle, api, luid)?;
    match kind {
        SharedKind::Fence => Ok(payload),
        SharedKind::Texture(_) => Err(LayerError::Import(format!(
            "handle {} refers to a texture, not a fence",
            handle.value
        ))),
    }
}

fn resolve(
    handle: &ShareableHandle,
    api: GraphicsApi,
    luid: AdapterLuid,
) -> LayerResult<(SharedKind, Arc<dyn Any + Send + Sync>)> {
    if handle.kind != HandleKind::InProcess {
        return Err(LayerError::Import(format!(
            "{} device cannot open NT handle {:#x}",
            api, handle.value
        )));
    }

    let table = SHARE_TABLE.lock();
    let entry = table
        .get(&handle.value)
        .ok_or_else(|| LayerError::Import(format!("stale handle {}", handle.value)))?;

    if entry.api != api {
        return Err(LayerError::Import(format!(
            "handle {} was created by a {} device, cannot open on {}",
            handle.value, entry.api, api
        )));
    }
    if entry.luid != luid {
        return Err(LayerError::Import(format!(
            "handle {} belongs to adapter {}, cannot open on adapter {}",
            handle.value, entry.luid, luid
        )));
    }

    Ok((entry.kind, entry.payload.clone()))
}

/// Retire every entry published by `owner`.
pub fn retire_owner(owner: u64) {
    let mut table = SHARE_TABLE.lock();
    let before = table.len();
    table.retain(|_, entry| entry.owner != owner);
    let retired = before - table.len();
    if retired > 0 {
        log::debug!("[GRAPHICS] Retired {} shared handle(s) of device {}", retired, owner);
    }
}
