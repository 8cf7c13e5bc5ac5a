#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use buzzer_contracts::device::{DeviceRecord, DeviceRegistration};
use buzzer_contracts::Validate;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::StorageError;

/// In-memory liveness map, keyed by device name. Not persisted.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    items: Mutex<BTreeMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        registration: DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<DeviceRecord, StorageError> {
        registration.validate()?;
        let record = DeviceRecord::from_registration(registration, now);
        debug!(name = %record.name, address = %record.address, "device seen");
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Sorted by name.
    pub fn list(&self) -> Vec<DeviceRecord> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
