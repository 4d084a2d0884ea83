pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use crate::domain::DeviceState;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("state store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence capability for per-device accounting state.
///
/// Called synchronously around every accepted update, so implementations
/// should be quick. A failing store never stops aggregation; the caller logs
/// the error and carries on in memory.
pub trait StateStore: Send + Sync {
    fn load(&self, device_id: &str) -> Result<Option<DeviceState>, StoreError>;

    fn save(&self, device_id: &str, state: &DeviceState) -> Result<(), StoreError>;
}
