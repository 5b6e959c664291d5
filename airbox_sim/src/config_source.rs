//! In-memory fleet configuration for simulation runs.

use airbox_core::config::apply_registration;
use airbox_core::{ConfigError, ConfigSource, FleetDocument, RegistrationOutcome, RegistrationUpdate};
use async_trait::async_trait;
use serde_json::Value;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Mutex;

/// Raw configuration document that scenarios can edit or remove.
#[derive(Default)]
pub struct SimConfigSource {
    document: Mutex<Option<Value>>,
}

impl SimConfigSource {
    pub fn new(document: Value) -> Self {
        Self {
            document: Mutex::new(Some(document)),
        }
    }

    /// Replaces the document.
    pub fn set(&self, document: Value) {
        *self.guard() = Some(document);
    }

    /// Removes the document; loads fail until it is set again.
    pub fn clear(&self) {
        *self.guard() = None;
    }

    pub fn snapshot(&self) -> Option<Value> {
        self.guard().clone()
    }

    /// Same semantics as the file store's registration update.
    pub fn update_registration(&self, update: &RegistrationUpdate) -> Result<RegistrationOutcome, ConfigError> {
        let mut guard = self.guard();
        let document = guard
            .as_mut()
            .ok_or_else(|| ConfigError::Io(IoError::new(ErrorKind::NotFound, "no simulated config")))?;
        apply_registration(document, update)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Option<Value>> {
        self.document.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ConfigSource for SimConfigSource {
    async fn load(&self) -> Result<FleetDocument, ConfigError> {
        match self.snapshot() {
            Some(document) => FleetDocument::from_value(document),
            None => Err(ConfigError::Io(IoError::new(ErrorKind::NotFound, "no simulated config"))),
        }
    }
}
