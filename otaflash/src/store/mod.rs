//! Persistent file store.
//!
//! The update cycle keeps a handful of small text documents between runs:
//! version strings, the staged firmware body and the retry counter. They are
//! read and written whole through the [`FileStore`] trait.
//!
//! - [`DirStore`]: a directory on the host filesystem
//! - [`MemoryStore`]: in-memory, for tests and dry runs

pub mod dir;
pub mod memory;

use crate::error::Result;

pub use dir::DirStore;
pub use memory::MemoryStore;

/// Whole-document file storage.
pub trait FileStore {
    /// Read a document.
    fn read(&self, name: &str) -> Result<String>;

    /// Create or replace a document.
    fn write(&mut self, name: &str, text: &str) -> Result<()>;

    /// Rename a document, replacing any existing `dst`.
    fn rename(&mut self, src: &str, dst: &str) -> Result<()>;

    /// Delete a document. Deleting a missing document is not an error.
    fn delete(&mut self, name: &str) -> Result<()>;

    /// Whether a document exists.
    fn exists(&self, name: &str) -> bool;

    /// List stored documents, sorted by name.
    fn list(&self) -> Result<Vec<StoredFile>>;

    /// Delete every document.
    fn format(&mut self) -> Result<()>;
}

impl<T: FileStore + ?Sized> FileStore for &mut T {
    fn read(&self, name: &str) -> Result<String> {
        (**self).read(name)
    }

    fn write(&mut self, name: &str, text: &str) -> Result<()> {
        (**self).write(name, text)
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        (**self).rename(src, dst)
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        (**self).delete(name)
    }

    fn exists(&self, name: &str) -> bool {
        (**self).exists(name)
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        (**self).list()
    }

    fn format(&mut self) -> Result<()> {
        (**self).format()
    }
}

/// Directory entry returned by [`FileStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StoredFile {
    /// Document name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Names of the documents used by the update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ArtifactNames {
    /// Version believed to be running on the target.
    pub onboard_version: String,
    /// Firmware body last flashed successfully.
    pub onboard_firmware: String,
    /// Version of the staged firmware.
    pub latest_version: String,
    /// Staged firmware body awaiting flashing.
    pub latest_firmware: String,
    /// Consecutive failed update attempts (decimal).
    pub retry_count: String,
}

impl Default for ArtifactNames {
    fn default() -> Self {
        Self {
            onboard_version: "fw-onboard.md".to_string(),
            onboard_firmware: "fw-onboard.hex".to_string(),
            latest_version: "fw-latest.md".to_string(),
            latest_firmware: "fw-latest.hex".to_string(),
            retry_count: "update-tries.md".to_string(),
        }
    }
}

impl ArtifactNames {
    /// All names, in a fixed order.
    pub fn all(&self) -> [&str; 5] {
        [
            &self.onboard_version,
            &self.onboard_firmware,
            &self.latest_version,
            &self.latest_firmware,
            &self.retry_count,
        ]
    }
}
