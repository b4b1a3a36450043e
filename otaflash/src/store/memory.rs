//! In-memory file store.

use crate::error::{Error, Result};
use crate::store::{FileStore, StoredFile};
use std::collections::BTreeMap;

/// File store held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: BTreeMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document, builder style.
    #[must_use]
    pub fn with_file(mut self, name: &str, text: &str) -> Self {
        self.files.insert(name.to_string(), text.to_string());
        self
    }

    /// Borrow a document without going through [`FileStore::read`].
    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FileStore for MemoryStore {
    fn read(&self, name: &str) -> Result<String> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("{name}: not found")))
    }

    fn write(&mut self, name: &str, text: &str) -> Result<()> {
        self.files.insert(name.to_string(), text.to_string());
        Ok(())
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let text = self
            .files
            .remove(src)
            .ok_or_else(|| Error::Storage(format!("{src}: not found")))?;
        self.files.insert(dst.to_string(), text);
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        self.files.remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        Ok(self
            .files
            .iter()
            .map(|(name, text)| StoredFile {
                name: name.clone(),
                size: text.len() as u64,
            })
            .collect())
    }

    fn format(&mut self) -> Result<()> {
        self.files.clear();
        Ok(())
    }
}
