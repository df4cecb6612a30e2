//! Pipeline cache persistence.
//!
//! The only state forge keeps across runs. The blob is stored per
//! `pipelineCacheUUID`, so a driver update simply starts from an empty cache.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Size of a `VK_PIPELINE_CACHE_HEADER_VERSION_ONE` header.
const HEADER_SIZE: usize = 16 + vk::UUID_SIZE;

/// Directory-backed store for pipeline cache blobs.
#[derive(Clone, Debug)]
pub struct PipelineCacheStore {
    dir: PathBuf,
}

impl PipelineCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the blob for `uuid`.
    pub fn path_for(&self, uuid: &[u8; vk::UUID_SIZE]) -> PathBuf {
        let hex = uuid.iter().fold(String::with_capacity(32), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        });
        self.dir.join(format!("pipeline_cache_{hex}.bin"))
    }

    /// Load the blob for `uuid`, or `None` if there is no usable one.
    ///
    /// A blob whose header does not name `uuid` is ignored rather than handed
    /// to the driver.
    pub fn load(&self, uuid: &[u8; vk::UUID_SIZE]) -> Option<Vec<u8>> {
        let path = self.path_for(uuid);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                debug!("No pipeline cache at {}: {}", path.display(), e);
                return None;
            }
        };

        match header_uuid(&data) {
            Some(found) if &found == uuid => {
                info!(
                    "Loaded pipeline cache ({} bytes) from {}",
                    data.len(),
                    path.display()
                );
                Some(data)
            }
            _ => {
                warn!(
                    "Ignoring pipeline cache {} with mismatching header",
                    path.display()
                );
                None
            }
        }
    }

    /// Persist `data` for `uuid`, creating the directory if needed.
    pub fn store(&self, uuid: &[u8; vk::UUID_SIZE], data: &[u8]) -> RhiResult<PathBuf> {
        if header_uuid(data).as_ref() != Some(uuid) {
            return Err(RhiError::PipelineCacheError(
                "refusing to store a blob produced by another device".into(),
            ));
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(uuid);
        std::fs::write(&path, data)?;
        info!(
            "Stored pipeline cache ({} bytes) to {}",
            data.len(),
            path.display()
        );
        Ok(path)
    }
}

/// The UUID recorded in a pipeline cache header.
fn header_uuid(data: &[u8]) -> Option<[u8; vk::UUID_SIZE]> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let header_len = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let version = u32::from_le_bytes(data[4..8].try_into().ok()?);
    if (header_len as usize) < HEADER_SIZE
        || version != vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32
    {
        return None;
    }
    data[16..HEADER_SIZE].try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuDevice;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineCacheStore::new(dir.path().join("cache"));
        let device = HeadlessDevice::new();
        let uuid = device.info().pipeline_cache_uuid;
        let blob = device.pipeline_cache_data().unwrap();

        let path = store.store(&uuid, &blob).unwrap();
        assert!(path.exists());
        assert_eq!(store.load(&uuid), Some(blob));
    }

    #[test]
    fn test_missing_blob_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineCacheStore::new(dir.path());
        assert_eq!(store.load(&[0u8; vk::UUID_SIZE]), None);
    }

    #[test]
    fn test_mismatching_header_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineCacheStore::new(dir.path());
        let device = HeadlessDevice::new();
        let blob = device.pipeline_cache_data().unwrap();

        // Plant the blob under a different uuid's file name.
        let other = [7u8; vk::UUID_SIZE];
        std::fs::write(store.path_for(&other), &blob).unwrap();
        assert_eq!(store.load(&other), None);
    }

    #[test]
    fn test_refuses_foreign_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineCacheStore::new(dir.path());
        assert!(store.store(&[1u8; vk::UUID_SIZE], &[0u8; 8]).is_err());
    }

    #[test]
    fn test_path_is_keyed_by_uuid() {
        let store = PipelineCacheStore::new("/tmp/forge");
        let path = store.path_for(&[0xab; vk::UUID_SIZE]);
        assert!(path
            .to_string_lossy()
            .ends_with(&format!("pipeline_cache_{}.bin", "ab".repeat(16))));
    }
}
