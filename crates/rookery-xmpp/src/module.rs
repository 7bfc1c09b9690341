//! Extension module host.
//!
//! Modules extend the server with additional routes or transports; the
//! multicast bridge is the bundled example. Each module goes through
//! the same lifecycle: construct, zero or more `configure` calls fed
//! from its config-file section, then `start` with the running server.
//! `stop` is called for every module that started, even when another
//! module's stop fails. Construction is a factory the caller supplies;
//! destruction is `Drop`.

use std::sync::Arc;

use tracing::{error, info};

use crate::server::XmppServer;
use crate::XmppError;

/// One loadable server extension.
pub trait Module: Send {
    /// Accept one `key = value` pair from the module's config section.
    fn configure(&mut self, key: &str, value: &str) -> Result<(), XmppError>;

    /// Hook into the running server. A failure here aborts server boot.
    fn start(&mut self, server: &Arc<XmppServer>) -> Result<(), XmppError>;

    /// Undo whatever `start` did.
    fn stop(&mut self) -> Result<(), XmppError>;
}

struct LoadedModule {
    name: String,
    module: Box<dyn Module>,
    started: bool,
}

/// Insertion-ordered collection of loaded modules.
pub struct ModuleHost {
    modules: Vec<LoadedModule>,
}

impl ModuleHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Register a constructed module under a name.
    pub fn load(&mut self, name: &str, module: Box<dyn Module>) -> Result<(), XmppError> {
        if self.modules.iter().any(|m| m.name == name) {
            return Err(XmppError::module(format!(
                "module '{}' already loaded",
                name
            )));
        }
        info!(module = name, "loaded module");
        self.modules.push(LoadedModule {
            name: name.to_owned(),
            module,
            started: false,
        });
        Ok(())
    }

    /// Pass one configuration pair to a loaded module.
    pub fn configure(&mut self, name: &str, key: &str, value: &str) -> Result<(), XmppError> {
        let entry = self
            .modules
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| XmppError::module(format!("module '{}' not loaded", name)))?;
        entry.module.configure(key, value)
    }

    /// Start every module in load order; the first failure aborts.
    pub fn start_all(&mut self, server: &Arc<XmppServer>) -> Result<(), XmppError> {
        for entry in &mut self.modules {
            entry.module.start(server).map_err(|e| {
                error!(module = %entry.name, error = %e, "module failed to start");
                e
            })?;
            entry.started = true;
            info!(module = %entry.name, "module started");
        }
        Ok(())
    }

    /// Stop every started module. One failing stop does not prevent the
    /// others from stopping; the first error is reported afterwards.
    pub fn stop_all(&mut self) -> Result<(), XmppError> {
        let mut first_error = None;
        for entry in &mut self.modules {
            if !entry.started {
                continue;
            }
            entry.started = false;
            if let Err(e) = entry.module.stop() {
                error!(module = %entry.name, error = %e, "module failed to stop");
                first_error.get_or_insert(e);
            } else {
                info!(module = %entry.name, "module stopped");
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of loaded modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is loaded.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for ModuleHost {
    fn default() -> Self {
        Self::new()
    }
}
