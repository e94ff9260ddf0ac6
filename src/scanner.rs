// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Module discovery.
//!
//! ndmgr groups dotfile configurations into __modules__. A module is a
//! directory under the source root that carries a `.ndmgr` descriptor file
//! at its top-level. The scanner walks the source root to a bounded depth,
//! emits every valid module it finds, and never recurses into a module
//! itself (nested descriptors belong to nested deployments, not to us).
//!
//! # Descriptor Format
//!
//! The `.ndmgr` descriptor is deliberately not TOML so that a module stays
//! parseable without any global configuration present. It is UTF-8, line
//! oriented: blank lines and lines starting with `#` are skipped, everything
//! else is `key = value` with optional double quotes around the value.
//! Recognized keys are `target_dir`, `ignore`, and `description`; unknown
//! keys are ignored silently.

use crate::{path, pattern};

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument, warn};

/// Name of the per-module descriptor file.
pub const MODULE_DESCRIPTOR: &str = ".ndmgr";

/// A discovered module.
///
/// Created by the scanner, read-only thereafter. The deployer owns the
/// listing for the duration of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Final path component under the source root.
    pub name: String,

    /// Absolute, canonical path of the module directory.
    pub path: PathBuf,

    /// Absolute path of the module's descriptor file.
    pub config_path: PathBuf,

    /// Raw target override from the descriptor. Expanded by the deployer,
    /// not here.
    pub target_dir: Option<String>,

    /// Skip this module during deployment.
    pub ignore: bool,

    /// Free-text description from the descriptor.
    pub description: Option<String>,
}

/// Parsed contents of a `.ndmgr` descriptor file.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Target base override for this module.
    pub target_dir: Option<String>,

    /// True iff the descriptor says the literal `true`.
    pub ignore: bool,

    /// Free-text description.
    pub description: Option<String>,
}

impl FromStr for ModuleDescriptor {
    type Err = std::convert::Infallible;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut descriptor = ModuleDescriptor::default();
        for line in data.lines() {
            let line = line.trim_matches(|c: char| c.is_ascii_whitespace());
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim_matches(|c: char| c.is_ascii_whitespace());
            let value = unquote(value.trim_matches(|c: char| c.is_ascii_whitespace()));

            match key {
                "target_dir" => descriptor.target_dir = Some(value.to_string()),
                "ignore" => descriptor.ignore = value == "true",
                "description" => descriptor.description = Some(value.to_string()),
                _ => continue,
            }
        }

        Ok(descriptor)
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

/// Pre-existing entry found where a module would be materialized.
///
/// Produced by [`ModuleScanner::preview_conflict`] so the deployer can emit
/// a diagnostic before delegating to the linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictInfo {
    /// A symlink is already there and does not point at the module.
    ExistingSymlink {
        /// The conflicting target path.
        target: PathBuf,
        /// The literal text of the existing link.
        link_target: PathBuf,
    },

    /// A real directory is already there.
    ExistingDirectory { target: PathBuf },

    /// A regular file (or anything else) is already there.
    ExistingFile { target: PathBuf },
}

impl std::fmt::Display for ConflictInfo {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictInfo::ExistingSymlink {
                target,
                link_target,
            } => write!(
                fmt,
                "existing symlink at {:?} pointing to {:?}",
                target.display(),
                link_target.display()
            ),
            ConflictInfo::ExistingDirectory { target } => {
                write!(fmt, "existing directory at {:?}", target.display())
            }
            ConflictInfo::ExistingFile { target } => {
                write!(fmt, "existing file at {:?}", target.display())
            }
        }
    }
}

/// Walk the source root and identify modules.
#[derive(Debug, Clone)]
pub struct ModuleScanner {
    source_root: PathBuf,
    scan_depth: u32,
    ignore_patterns: Vec<String>,
}

impl ModuleScanner {
    /// Construct new module scanner rooted at `source_root`.
    ///
    /// # Errors
    ///
    /// - Return [`ScanError::InvalidDepth`] if `scan_depth` is zero.
    /// - Return [`ScanError::Path`] if the source root cannot be
    ///   canonicalized.
    pub fn new(
        source_root: impl AsRef<Path>,
        scan_depth: u32,
        ignore_patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        if scan_depth == 0 {
            return Err(ScanError::InvalidDepth);
        }

        Ok(Self {
            source_root: path::canonicalize(source_root)?,
            scan_depth,
            ignore_patterns: ignore_patterns.into_iter().map(Into::into).collect(),
        })
    }

    /// Absolute, canonical source root being scanned.
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Discover all modules under the source root.
    ///
    /// The listing is sorted by module name ascending in codepoint order,
    /// with the full path as a deterministic tie-break. A directory whose
    /// descriptor cannot be read is reported invalid and left out rather
    /// than failing the whole scan.
    ///
    /// # Errors
    ///
    /// - Return [`ScanError::SourceUnreadable`] if a directory in the walk
    ///   cannot be opened.
    #[instrument(skip(self), level = "debug")]
    pub fn scan(&self) -> Result<Vec<Module>> {
        let mut modules = Vec::new();
        self.scan_dir(&self.source_root, 0, &mut modules)?;
        modules.sort_by(|lhs, rhs| {
            lhs.name
                .cmp(&rhs.name)
                .then_with(|| lhs.path.cmp(&rhs.path))
        });
        debug!("discovered {} modules", modules.len());

        Ok(modules)
    }

    fn scan_dir(&self, dir: &Path, depth: u32, modules: &mut Vec<Module>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|err| ScanError::SourceUnreadable {
            source: err,
            path: dir.into(),
        })?;

        for entry in entries {
            let entry = entry.map_err(|err| ScanError::SourceUnreadable {
                source: err,
                path: dir.into(),
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if pattern::matches_any(&name, &self.ignore_patterns) {
                continue;
            }

            let entry_path = entry.path();
            if !entry_path.is_dir() {
                continue;
            }

            let config_path = entry_path.join(MODULE_DESCRIPTOR);
            if config_path.is_file() {
                match self.open_module(name, &entry_path, config_path) {
                    Ok(module) => modules.push(module),
                    Err(err) => warn!("skipping invalid module: {err}"),
                }
            } else if depth + 1 < self.scan_depth {
                self.scan_dir(&entry_path, depth + 1, modules)?;
            }
        }

        Ok(())
    }

    fn open_module(
        &self,
        name: String,
        module_path: &Path,
        config_path: PathBuf,
    ) -> Result<Module> {
        let data =
            fs::read_to_string(&config_path).map_err(|err| ScanError::SourceUnreadable {
                source: err,
                path: config_path.clone(),
            })?;

        // INVARIANT: Descriptor parsing is lenient and never fails.
        let ModuleDescriptor {
            target_dir,
            ignore,
            description,
        } = data.parse().unwrap_or_default();

        Ok(Module {
            name,
            path: path::canonicalize(module_path)?,
            config_path,
            target_dir,
            ignore,
            description,
        })
    }

    /// Report whether deploying `module` under `target_base` would conflict.
    ///
    /// Probes `target_base/module.name`. A symlink that already resolves to
    /// the canonical module path is no conflict at all.
    pub fn preview_conflict(
        &self,
        module: &Module,
        target_base: impl AsRef<Path>,
    ) -> Option<ConflictInfo> {
        let target = target_base.as_ref().join(&module.name);
        match path::classify(&target) {
            path::PathKind::Missing => None,
            path::PathKind::Symlink => {
                let link_target = path::read_link(&target).ok()?;
                if resolves_to(&target, &link_target, &module.path) {
                    return None;
                }

                Some(ConflictInfo::ExistingSymlink {
                    target,
                    link_target,
                })
            }
            path::PathKind::Dir => Some(ConflictInfo::ExistingDirectory { target }),
            _ => Some(ConflictInfo::ExistingFile { target }),
        }
    }
}

// Resolve the literal link text stored at `link` and compare against an
// absolute canonical destination.
fn resolves_to(link: &Path, link_target: &Path, destination: &Path) -> bool {
    let resolved = if link_target.is_absolute() {
        link_target.to_path_buf()
    } else {
        match link.parent() {
            Some(parent) => parent.join(link_target),
            None => return false,
        }
    };

    path::canonicalize(resolved)
        .map(|resolved| resolved == destination)
        .unwrap_or(false)
}

/// Module scanning error types.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Scan depth of zero scans nothing.
    #[error("scan depth must be at least 1")]
    InvalidDepth,

    /// Source subtree cannot be opened.
    #[error("failed to read source tree at {:?}", path.display())]
    SourceUnreadable {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Path resolution fails.
    #[error(transparent)]
    Path(#[from] crate::path::PathError),
}

/// Friendly result alias :3
pub type Result<T, E = ScanError> = std::result::Result<T, E>;
