//! File-backed adapters that satisfy the domain storage traits.

mod cursor_store;

use std::path::PathBuf;

/// Block cursor persisted as a single decimal integer in a plain file.
///
/// Each save writes a sibling temp file, syncs it and renames it over the
/// target so readers never observe a torn value.
#[derive(Debug, Clone)]
pub struct FileCursor {
    path: PathBuf,
}

impl FileCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
