// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Common fixtures for ndmgr integration tests.

use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// One disposable symlink farm: a source root of modules and a target tree.
pub struct Farm {
    pub temp: TempDir,
}

#[allow(dead_code)]
impl Farm {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("failed to create temp directory");
        fs::create_dir(temp.path().join("src")).expect("failed to create source root");
        fs::create_dir(temp.path().join("tgt")).expect("failed to create target root");

        Self { temp }
    }

    pub fn source(&self) -> PathBuf {
        self.temp.path().join("src")
    }

    pub fn target(&self) -> PathBuf {
        self.temp.path().join("tgt")
    }

    /// Create a module directory with a descriptor and content files.
    pub fn module(&self, name: &str, descriptor: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.source().join(name);
        fs::create_dir_all(&dir).expect("failed to create module directory");
        fs::write(dir.join(".ndmgr"), descriptor).expect("failed to write descriptor");
        for (relative, contents) in files {
            self.write(&dir.join(relative), contents);
        }

        dir
    }

    /// Write a file, creating parent directories as needed.
    pub fn write(&self, path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directory");
        }
        fs::write(path, contents).expect("failed to write file");
    }

    /// Place a file under the target tree.
    pub fn write_target(&self, relative: &str, contents: &str) {
        self.write(&self.target().join(relative), contents);
    }

    pub fn read(&self, path: &Path) -> String {
        fs::read_to_string(path).expect("failed to read file")
    }

    pub fn link_text(&self, path: &Path) -> PathBuf {
        fs::read_link(path).expect("failed to read symlink")
    }

    pub fn is_symlink(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
    }

    pub fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }
}
