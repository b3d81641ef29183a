//! Session-keyed framework registry and the function interception table.

use std::collections::HashMap;
use std::sync::Arc;

use openxr_sys as xr;
use parking_lot::{Mutex, RwLock};

use super::CompositionFramework;
use crate::error::{LayerError, LayerResult};

/// Maps session handles to their composition framework.
///
/// The lock covers a single lookup, insert or erase and is never held while
/// a framework is created or dropped.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<CompositionFramework>>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: xr::Session, framework: Arc<CompositionFramework>) -> LayerResult<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.into_raw()) {
            return Err(LayerError::Configuration(format!(
                "session {:?} already has a composition framework",
                session
            )));
        }
        sessions.insert(session.into_raw(), framework);
        Ok(())
    }

    pub fn get(&self, session: xr::Session) -> LayerResult<Arc<CompositionFramework>> {
        self.sessions
            .lock()
            .get(&session.into_raw())
            .cloned()
            .ok_or_else(|| LayerError::NotFound(format!("no composition framework for session {:?}", session)))
    }

    pub fn remove(&self, session: xr::Session) -> Option<Arc<CompositionFramework>> {
        self.sessions.lock().remove(&session.into_raw())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<Arc<CompositionFramework>> {
        self.sessions.lock().drain().map(|(_, framework)| framework).collect()
    }
}

struct Interception {
    replacement: xr::pfn::VoidFunction,
    real: Option<xr::pfn::VoidFunction>,
}

/// Entry points the layer substitutes.
///
/// A name is registered with its replacement. When the dispatch layer
/// resolves that name, the real implementation is recorded and the
/// replacement is handed out instead.
#[derive(Default)]
pub struct InterceptionRegistry {
    entries: RwLock<HashMap<String, Interception>>,
}

impl InterceptionRegistry {
    pub fn register(&self, name: &str, replacement: xr::pfn::VoidFunction) {
        log::debug!("[COMPOSITION] Intercepting {}", name);
        self.entries.write().insert(
            name.to_string(),
            Interception {
                replacement,
                real: None,
            },
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Record the real implementation of `name` and substitute the
    /// replacement. Returns whether `name` is intercepted.
    pub fn resolve(&self, name: &str, function: &mut Option<xr::pfn::VoidFunction>) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };
        let Some(real) = *function else {
            log::warn!("[COMPOSITION] {} resolved to nothing, not intercepting", name);
            return false;
        };
        entry.real = Some(real);
        *function = Some(entry.replacement);
        true
    }

    /// Real implementation recorded for `name`.
    pub fn real(&self, name: &str) -> Option<xr::pfn::VoidFunction> {
        self.entries.read().get(name).and_then(|entry| entry.real)
    }
}
