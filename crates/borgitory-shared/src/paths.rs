//! # Path Service
//!
//! Three operations behind one small type: the data directory, the temp
//! directory for secret materialization, and `secure_join`, which refuses
//! to produce a path outside its base.

use std::path::{Component, Path, PathBuf};

use crate::errors::{BorgitoryError, BorgitoryResult};

/// Filesystem locations used by the core
#[derive(Debug, Clone)]
pub struct PathService {
    data_dir: PathBuf,
    temp_dir: PathBuf,
}

impl PathService {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let temp_dir = data_dir.join("tmp");
        Self { data_dir, temp_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Create both directories if absent
    pub fn ensure_dirs(&self) -> BorgitoryResult<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }

    /// Join `parts` onto `base`, rejecting any part that would escape it.
    /// Absolute parts, parent-dir traversal, and drive prefixes are refused.
    pub fn secure_join<I, S>(base: &Path, parts: I) -> BorgitoryResult<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = base.to_path_buf();
        for part in parts {
            let part = part.as_ref();
            for component in Path::new(part).components() {
                match component {
                    Component::Normal(c) => joined.push(c),
                    Component::CurDir => {}
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(BorgitoryError::Validation(format!(
                            "path component {part:?} escapes {}",
                            base.display()
                        )));
                    }
                }
            }
        }
        Ok(joined)
    }
}
