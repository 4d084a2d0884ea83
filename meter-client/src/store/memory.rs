use std::collections::HashMap;

use parking_lot::Mutex;

use super::{StateStore, StoreError};
use crate::domain::DeviceState;

/// Process-local store; state is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, DeviceState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, device_id: &str) -> Result<Option<DeviceState>, StoreError> {
        Ok(self.states.lock().get(device_id).cloned())
    }

    fn save(&self, device_id: &str, state: &DeviceState) -> Result<(), StoreError> {
        self.states.lock().insert(device_id.to_string(), state.clone());
        Ok(())
    }
}
