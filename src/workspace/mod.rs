pub mod tracker;

pub use tracker::FileAccessTracker;

use crate::error::{HealError, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// The local checkout that patches are validated and applied against.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingTree {
    root: PathBuf,
    branch: String,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            branch: branch.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Map a repository-relative path into the tree, refusing absolute paths
    /// and `..` segments.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let mut out = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(HealError::PathOutsideTree(
                        relative.display().to_string(),
                    ));
                }
            }
        }
        if out == self.root {
            return Err(HealError::PathOutsideTree(relative.display().to_string()));
        }
        Ok(out)
    }

    /// File content, or `None` when the file does not exist.
    pub fn read(&self, relative: impl AsRef<Path>) -> Result<Option<String>> {
        let path = self.resolve(relative)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        self.resolve(relative).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Append one line, creating the file (and its directories) when missing.
    /// Existing bytes are never rewritten; a newline is added first when the
    /// file does not already end with one.
    pub fn append_line(&self, relative: impl AsRef<Path>, line: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut entry = String::new();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                entry.push('\n');
            }
        }
        entry.push_str(line.trim_end_matches('\n'));
        entry.push('\n');

        file.write_all(entry.as_bytes())?;
        file.flush()?;
        Ok(path)
    }
}
