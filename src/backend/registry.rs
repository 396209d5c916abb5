//! Backend cache
//!
//! Maps an immutable [`ModelConfig`] to a singleton backend instance
//! for the lifetime of the process, so expensive initialization (HTTP
//! client setup, model loading) happens once per distinct
//! configuration. The config is the exact-match key: two configs with
//! identical field values resolve to the same instance.
//!
//! Backend kinds form a finite enumeration, each bound to a
//! constructor at startup. The OpenAI constructor is built in; the
//! local constructor is registered by the embedding application, which
//! owns the model-loading capability.

use super::{BackendError, LoggingBackend, ModelBackend, OpenAiBackend};
use crate::config::{BackendKind, ModelConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Constructor bound to one [`BackendKind`].
pub type BackendCtor =
    Box<dyn Fn(&ModelConfig) -> Result<Arc<dyn ModelBackend>, BackendError> + Send + Sync>;

/// Process-lifetime cache of backend instances.
pub struct BackendCache {
    constructors: HashMap<BackendKind, BackendCtor>,
    instances: Mutex<HashMap<ModelConfig, Arc<dyn ModelBackend>>>,
}

impl Default for BackendCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCache {
    pub fn new() -> Self {
        let mut constructors: HashMap<BackendKind, BackendCtor> = HashMap::new();
        constructors.insert(BackendKind::OpenAi, Box::new(OpenAiBackend::from_config));
        Self {
            constructors,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Bind (or rebind) a constructor for `kind`. Call before the first
    /// `get` for configs of that kind.
    pub fn register(
        &mut self,
        kind: BackendKind,
        ctor: impl Fn(&ModelConfig) -> Result<Arc<dyn ModelBackend>, BackendError>
            + Send
            + Sync
            + 'static,
    ) {
        self.constructors.insert(kind, Box::new(ctor));
    }

    /// Resolve the singleton backend for `config`, constructing and
    /// caching it on first use.
    pub fn get(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, BackendError> {
        {
            let instances = self.instances.lock().expect("backend cache poisoned");
            if let Some(backend) = instances.get(config) {
                return Ok(Arc::clone(backend));
            }
        }

        let ctor = self.constructors.get(&config.backend).ok_or_else(|| {
            BackendError::unsupported(format!(
                "no constructor registered for backend kind {:?}",
                config.backend
            ))
        })?;

        // Construction can be slow (model loading); done outside the
        // fast path but inside a single logical get.
        let backend = ctor(config)?;
        let backend: Arc<dyn ModelBackend> =
            Arc::new(LoggingBackend::new(config.title.clone(), backend));

        let mut instances = self.instances.lock().expect("backend cache poisoned");
        let entry = instances
            .entry(config.clone())
            .or_insert_with(|| Arc::clone(&backend));
        Ok(Arc::clone(entry))
    }
}
