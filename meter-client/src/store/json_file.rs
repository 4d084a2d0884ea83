use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use super::{StateStore, StoreError};
use crate::domain::DeviceState;

/// One pretty-printed JSON document per device under `dir`.
///
/// Device ids are percent-encoded into file names, so any id maps to a
/// single file inside the directory. Writes go to a temp file first and are
/// renamed into place.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_stem(device_id)))
    }
}

/// Percent-encodes everything but `A-Za-z0-9-_.~`, so separators never
/// reach the file system.
fn encode_file_stem(device_id: &str) -> String {
    urlencoding::encode(device_id).into_owned()
}

impl StateStore for JsonFileStore {
    fn load(&self, device_id: &str) -> Result<Option<DeviceState>, StoreError> {
        let path = self.path_for(device_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: DeviceState = serde_json::from_str(&contents)?;
        tracing::debug!(device_id, path = %path.display(), "loaded device state");

        Ok(Some(state))
    }

    fn save(&self, device_id: &str, state: &DeviceState) -> Result<(), StoreError> {
        let path = self.path_for(device_id);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }
}
