// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the global configuration file that ndmgr uses to
//! simplify the process of serialization and deserialization. File I/O is
//! left to the caller to figure out.
//!
//! The per-module `.ndmgr` descriptor is _not_ part of this layout. It is a
//! plain line-oriented format owned by the module scanner, because modules
//! must stay parseable even when no global configuration exists at all.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Global configuration layout.
///
/// Composed of general settings, linking engine settings, git coordination
/// settings, and a listing of tracked repositories. Every section is
/// optional on disk; missing sections fall back to their documented
/// defaults.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Config {
    /// General settings shared by every subcommand.
    #[serde(default)]
    pub settings: GeneralSettings,

    /// Settings for the linking engine.
    #[serde(default)]
    pub linking: LinkingSettings,

    /// Settings for git coordination.
    #[serde(default)]
    pub git: GitSettings,

    /// Tracked repository listing.
    #[serde(rename = "repository")]
    pub repositories: Option<Vec<RepositoryEntry>>,
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on all configured paths.
        if let Some(target) = config.settings.default_target.take() {
            config.settings.default_target = Some(expand_config_path(target)?);
        }

        if let Some(repositories) = config.repositories.as_mut() {
            for repository in repositories {
                repository.path = expand_config_path(std::mem::take(&mut repository.path))?;
            }
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_config_path(path: impl Into<PathBuf>) -> Result<PathBuf> {
    let path = path.into();
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();

    Ok(PathBuf::from(expanded))
}

/// General settings shared by every subcommand.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    /// Target base directory to materialize modules into. Defaults to the
    /// user's home directory when unset.
    pub default_target: Option<PathBuf>,

    /// Emit verbose diagnostics.
    #[serde(default)]
    pub verbose: bool,
}

/// Settings for the linking engine.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LinkingSettings {
    /// Policy for pre-existing target paths.
    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,

    /// Strategy for collapsing directory trees into directory symlinks.
    #[serde(default)]
    pub tree_folding: FoldStrategy,

    /// Write a backup before removing any pre-existing target entry.
    #[serde(default = "default_backup_conflicts")]
    pub backup_conflicts: bool,

    /// Suffix appended to backup paths. A leading dot is normalized away.
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,

    /// Depth to scan for modules under the source root. Must be at least 1.
    #[serde(default = "default_scan_depth")]
    pub scan_depth: u32,

    /// Base name patterns to skip during scanning and linking.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

impl Default for LinkingSettings {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictPolicy::default(),
            tree_folding: FoldStrategy::default(),
            backup_conflicts: default_backup_conflicts(),
            backup_suffix: default_backup_suffix(),
            scan_depth: default_scan_depth(),
            ignore_patterns: Vec::new(),
        }
    }
}

fn default_backup_conflicts() -> bool {
    true
}

fn default_backup_suffix() -> String {
    "bkp".into()
}

fn default_scan_depth() -> u32 {
    1
}

/// Settings for git coordination.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct GitSettings {
    /// How to resolve diverged local and remote history.
    #[serde(default)]
    pub conflict_resolution: GitConflictPolicy,

    /// Template for auto-commit messages. Supports `{date}` and `{hostname}`
    /// placeholders.
    #[serde(default = "default_commit_message_template")]
    pub commit_message_template: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            conflict_resolution: GitConflictPolicy::default(),
            commit_message_template: default_commit_message_template(),
        }
    }
}

fn default_commit_message_template() -> String {
    "dotfiles sync {date} on {hostname}".into()
}

/// Tracked repository entry.
///
/// Each entry names a repository that backs one or more modules, so the same
/// dotfiles can be synchronized across machines.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RepositoryEntry {
    /// Local name of the repository.
    pub name: String,

    /// Local path of the repository clone.
    pub path: PathBuf,

    /// Remote URL to clone from and push to.
    pub remote: String,

    /// Branch to track. Defaults to the remote's default branch.
    pub branch: Option<String>,

    /// Commit local changes automatically during sync.
    #[serde(default)]
    pub auto_commit: bool,
}

/// Policy for pre-existing entries at a target path.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Report the conflict and abort the module.
    #[default]
    Fail,

    /// Leave the existing entry alone and move on.
    Skip,

    /// Import the existing entry into the source module, then link.
    Adopt,

    /// Back up or remove the existing entry, then link.
    Replace,
}

/// Strategy for collapsing directory trees into directory symlinks.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FoldStrategy {
    /// Fold only where the target directory does not exist yet.
    #[default]
    Directory,

    /// Additionally fold over empty target directories and directories whose
    /// entire contents are already-managed symlinks.
    Aggressive,
}

/// Policy for diverged local and remote git history.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GitConflictPolicy {
    /// Prompt the user per repository.
    #[default]
    Ask,

    /// Keep local history, force push.
    Local,

    /// Keep remote history, discard local divergence.
    Remote,
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
