//! Process-wide context handed to every component
//!
//! Replaces process-global manager singletons: a component reaches its
//! process name, the configuration and the global manager link through the
//! context it was given when added to a [`crate::manager::LocalManager`].

use crate::config::ManagerConfig;
use crate::manager::global::GlobalClient;
use parking_lot::RwLock;
use std::sync::Arc;

struct ContextInner {
    config: ManagerConfig,
    global: RwLock<Option<GlobalClient>>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                global: RwLock::new(None),
            }),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.inner.config.process_name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Link to the global manager, once the process has joined the network
    pub fn global(&self) -> Option<GlobalClient> {
        self.inner.global.read().clone()
    }

    pub(crate) fn set_global(&self, global: Option<GlobalClient>) {
        *self.inner.global.write() = global;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("process", &self.process_name())
            .field("networked", &self.inner.global.read().is_some())
            .finish()
    }
}
