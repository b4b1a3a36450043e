//! File store backed by a host directory.

use crate::error::{Error, Result};
use crate::store::{FileStore, StoredFile};
use log::{debug, trace};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Suffix of in-flight writes.
const TMP_SUFFIX: &str = ".tmp";

/// File store rooted at a directory.
///
/// Document names map to files directly under the root. A leading `/` is
/// accepted and ignored; any other path separator is rejected.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

fn storage_error(name: &str, err: &std::io::Error) -> Error {
    Error::Storage(format!("{name}: {err}"))
}

impl DirStore {
    /// Open a store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| storage_error(&root.display().to_string(), &e))?;
        debug!("File store at {}", root.display());
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        let file = name.strip_prefix('/').unwrap_or(name);
        if file.is_empty()
            || file == "."
            || file == ".."
            || file.contains(['/', '\\'])
            || file.ends_with(TMP_SUFFIX)
        {
            return Err(Error::Storage(format!("invalid document name {name:?}")));
        }
        Ok(self.root.join(file))
    }
}

impl FileStore for DirStore {
    fn read(&self, name: &str) -> Result<String> {
        let path = self.path(name)?;
        fs::read_to_string(&path).map_err(|e| storage_error(name, &e))
    }

    fn write(&mut self, name: &str, text: &str) -> Result<()> {
        let path = self.path(name)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        trace!("Writing {} bytes to {}", text.len(), path.display());
        fs::write(&tmp, text).map_err(|e| storage_error(name, &e))?;
        fs::rename(&tmp, &path).map_err(|e| storage_error(name, &e))
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let from = self.path(src)?;
        let to = self.path(dst)?;
        trace!("Renaming {src} -> {dst}");
        fs::rename(from, to).map_err(|e| storage_error(src, &e))
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(name, &e)),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).is_ok_and(|p| p.is_file())
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        let root = self.root.display().to_string();
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| storage_error(&root, &e))? {
            let entry = entry.map_err(|e| storage_error(&root, &e))?;
            let meta = entry.metadata().map_err(|e| storage_error(&root, &e))?;
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            files.push(StoredFile {
                name,
                size: meta.len(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn format(&mut self) -> Result<()> {
        let root = self.root.display().to_string();
        for entry in fs::read_dir(&self.root).map_err(|e| storage_error(&root, &e))? {
            let path = entry.map_err(|e| storage_error(&root, &e))?.path();
            if path.is_file() {
                fs::remove_file(&path)
                    .map_err(|e| storage_error(&path.display().to_string(), &e))?;
            }
        }
        debug!("Formatted file store at {root}");
        Ok(())
    }
}
