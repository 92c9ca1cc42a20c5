//! Notebook storage on the local filesystem.

use std::path::{Component, Path, PathBuf};

use colab_core::ContentManager;

#[derive(Debug, Clone)]
pub struct FileNotebookManager {
    root: PathBuf,
}

impl FileNotebookManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a notebook path relative to the root. Absolute paths and `..` are rejected.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        safe.then(|| self.root.join(relative))
    }

    /// Directory a kernel for `notebook` should run in.
    pub fn kernel_dir(&self, notebook: &str) -> Option<PathBuf> {
        let path = self.resolve(notebook)?;
        match path.parent() {
            Some(parent) if parent.is_dir() => Some(parent.to_path_buf()),
            _ => Some(self.root.clone()),
        }
    }
}

impl ContentManager for FileNotebookManager {
    fn info_string(&self) -> String {
        format!("Serving notebooks from local directory: {}", self.root.display())
    }
}
