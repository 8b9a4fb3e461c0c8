//! Shared fixtures for integration tests.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A throwaway project directory built from `(relative path, contents)`
/// pairs.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new(files: &[(&str, &str)]) -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let project = Self { dir };
        for (rel, contents) in files {
            project.write(rel, contents)?;
        }
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> anyhow::Result<()> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn read(&self, rel: &str) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(self.path(rel))?)
    }
}
