// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Linking engine.
//!
//! The linker materializes one module against one target base by creating
//! symbolic links, and reverses the process with a matching unlink. It is
//! deterministic, non-destructive, and safe to re-run: a target already in
//! the desired state is left byte-for-byte alone.
//!
//! # Link Text Convention
//!
//! Every symlink written by the linker stores a __relative__ path computed
//! from the link's parent directory to the source entry, so whole source and
//! target trees can be moved together without relinking. A symlink with
//! absolute link text is treated as foreign, even if it happens to resolve
//! to the same file, and is preserved by unlink.
//!
//! # Conflict Handling
//!
//! Pre-existing target entries are reconciled under a per-invocation
//! [`ConflictPolicy`]. `Fail` aborts the module, `Skip` leaves the entry,
//! `Replace` backs it up (or removes it) and links, and `Adopt` imports the
//! entry into the source module so subsequent syncs distribute it to every
//! machine.

pub mod analyze;

use crate::{
    config::{ConflictPolicy, FoldStrategy, LinkingSettings},
    path::{self, PathKind},
    pattern,
    scanner::MODULE_DESCRIPTOR,
};

use analyze::{TreeAnalysis, TreeAnalyzer};
use inquire::Confirm;
use std::{
    collections::VecDeque,
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// Per-module, per-invocation linker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkerOptions {
    /// Emit per-link diagnostics at info level.
    pub verbose: bool,

    /// Base name patterns to skip entirely.
    pub ignore_patterns: Vec<String>,

    /// Policy for pre-existing target entries.
    pub conflict_resolution: ConflictPolicy,

    /// Strategy for collapsing directory trees into directory symlinks.
    pub tree_folding: FoldStrategy,

    /// Write a backup before removing any pre-existing target entry.
    pub backup_conflicts: bool,

    /// Suffix appended to backup paths. A leading dot is normalized away.
    pub backup_suffix: String,

    /// How interactive prompts resolve.
    pub force: ForceMode,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        Self::from(&LinkingSettings::default())
    }
}

impl From<&LinkingSettings> for LinkerOptions {
    fn from(settings: &LinkingSettings) -> Self {
        Self {
            verbose: false,
            ignore_patterns: settings.ignore_patterns.clone(),
            conflict_resolution: settings.conflict_resolution,
            tree_folding: settings.tree_folding,
            backup_conflicts: settings.backup_conflicts,
            backup_suffix: settings.backup_suffix.clone(),
            force: ForceMode::default(),
        }
    }
}

/// How interactive prompts resolve without a user present.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceMode {
    /// Ask through the prompt handler.
    #[default]
    None,

    /// Answer every prompt with its documented default.
    Default,

    /// Answer every prompt with yes.
    Yes,

    /// Answer every prompt with no.
    No,
}

/// Capability for asking the user yes/no questions.
///
/// Injected into the linker so tests can script answers instead of blocking
/// on standard input.
pub trait PromptHandler {
    /// Ask a yes/no question, returning `default` when no answer can be
    /// obtained.
    fn ask_yes_no(&mut self, question: &str, default: bool) -> bool;

    /// Project a force mode onto a prompt. Only [`ForceMode::None`] reaches
    /// [`PromptHandler::ask_yes_no`].
    fn confirm(&mut self, question: &str, default: bool, force: ForceMode) -> bool {
        match force {
            ForceMode::Yes => true,
            ForceMode::No => false,
            ForceMode::Default => default,
            ForceMode::None => self.ask_yes_no(question, default),
        }
    }
}

/// Interactive prompt handler for terminal sessions.
#[derive(Debug, Default, Clone)]
pub struct ConsolePrompter;

impl PromptHandler for ConsolePrompter {
    fn ask_yes_no(&mut self, question: &str, default: bool) -> bool {
        Confirm::new(question)
            .with_default(default)
            .prompt()
            .unwrap_or(default)
    }
}

/// Scripted prompt handler for tests and non-interactive callers.
///
/// Pops pre-recorded answers in order, then falls back to a fixed answer.
#[derive(Debug, Default, Clone)]
pub struct ScriptedPrompter {
    answers: VecDeque<bool>,
    fallback: bool,
}

impl ScriptedPrompter {
    /// Construct new scripted prompter.
    pub fn new(answers: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            fallback,
        }
    }

    /// Answer yes to everything.
    pub fn always_yes() -> Self {
        Self::new([], true)
    }
}

impl PromptHandler for ScriptedPrompter {
    fn ask_yes_no(&mut self, _question: &str, _default: bool) -> bool {
        self.answers.pop_front().unwrap_or(self.fallback)
    }
}

/// Counters describing what one link or unlink invocation did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkingStats {
    /// File symlinks created.
    pub files_linked: usize,

    /// Directory symlinks created.
    pub dirs_linked: usize,

    /// Conflicting entries left alone by the `Skip` policy or a declined
    /// adoption.
    pub files_skipped: usize,

    /// Conflicts resolved by `Adopt` or `Replace`.
    pub conflicts_resolved: usize,

    /// Files imported into the source module.
    pub files_adopted: usize,

    /// Backups written for pre-existing target entries.
    pub backups_created: usize,
}

impl LinkingStats {
    /// Check if the invocation mutated nothing at all.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }

    /// Fold another invocation's counters into this one.
    pub fn merge(&mut self, other: &LinkingStats) {
        self.files_linked += other.files_linked;
        self.dirs_linked += other.dirs_linked;
        self.files_skipped += other.files_skipped;
        self.conflicts_resolved += other.conflicts_resolved;
        self.files_adopted += other.files_adopted;
        self.backups_created += other.backups_created;
    }
}

impl Display for LinkingStats {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{} files linked, {} dirs linked, {} skipped, {} conflicts resolved, {} adopted, {} backups",
            self.files_linked,
            self.dirs_linked,
            self.files_skipped,
            self.conflicts_resolved,
            self.files_adopted,
            self.backups_created,
        )
    }
}

// What kind of symlink is being placed at a target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    File,
    Dir,
}

/// Link or unlink one module against one target base.
#[derive(Debug)]
pub struct Linker<P = ConsolePrompter>
where
    P: PromptHandler,
{
    source: PathBuf,
    target: PathBuf,
    managed_root: PathBuf,
    options: LinkerOptions,
    prompter: P,
    stats: LinkingStats,
}

impl<P> Linker<P>
where
    P: PromptHandler,
{
    /// Construct new linker for one module.
    ///
    /// Both `source` (the module directory) and `target` (the target base)
    /// are canonicalized up front so every relative link is computed from
    /// stable absolute paths.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::Path`] if either directory cannot be
    ///   canonicalized.
    pub fn new(
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        options: LinkerOptions,
        prompter: P,
    ) -> Result<Self> {
        let source = path::canonicalize(source)?;
        let target = path::canonicalize(target)?;
        // Siblings of the module count as managed content for folding.
        let managed_root = source.parent().unwrap_or(&source).to_path_buf();

        Ok(Self {
            source,
            target,
            managed_root,
            options,
            prompter,
            stats: LinkingStats::default(),
        })
    }

    /// Widen the managed source root used for aggressive fold checks.
    pub fn with_managed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.managed_root = root.into();
        self
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &LinkingStats {
        &self.stats
    }

    /// Link the module into the target base.
    ///
    /// Traverses the source tree in a single pass driven by an up-front
    /// [`TreeAnalysis`]. Applying link to an already-linked target performs
    /// no filesystem mutation and increments no counters.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::ConflictDetected`] under the `Fail` policy when
    ///   a pre-existing entry is in the way.
    /// - Return [`LinkError::BackupConflict`] when an existing backup would
    ///   be overwritten and the answer was no.
    /// - Return [`LinkError::SourceUnreadable`] if the source tree cannot be
    ///   opened.
    #[instrument(skip(self), level = "debug")]
    pub fn link(&mut self) -> Result<()> {
        debug!(
            "link {:?} -> {:?}",
            self.source.display(),
            self.target.display()
        );
        let analysis = TreeAnalyzer::new(
            &self.target,
            &self.managed_root,
            self.options.tree_folding,
            self.options.conflict_resolution,
            &self.options.ignore_patterns,
        )
        .analyze(&self.source)?;

        self.link_dir(&self.source.clone(), Path::new(""), &analysis)
    }

    /// Unlink the module from the target base.
    ///
    /// Only symlinks whose literal text matches what link would have written
    /// are removed. Foreign entries, missing targets, and partially linked
    /// states are all left alone, so unlink is safe to run repeatedly.
    ///
    /// # Errors
    ///
    /// - Return [`LinkError::SourceUnreadable`] if the source tree cannot be
    ///   opened.
    #[instrument(skip(self), level = "debug")]
    pub fn unlink(&mut self) -> Result<usize> {
        let mut removed = 0;
        self.unlink_dir(&self.source.clone(), Path::new(""), &mut removed)?;
        debug!("removed {removed} links under {:?}", self.target.display());

        Ok(removed)
    }

    fn link_dir(&mut self, dir: &Path, relative: &Path, analysis: &TreeAnalysis) -> Result<()> {
        for entry in read_source_dir(dir)? {
            let (name, source_path) = entry?;
            // Filtered names are invisible rather than skipped, so an
            // idempotent re-link still counts nothing at all.
            if name == MODULE_DESCRIPTOR
                || pattern::matches_any(&name, &self.options.ignore_patterns)
            {
                debug!("ignoring {:?}", source_path.display());
                continue;
            }

            let rel_path = relative.join(&name);
            let target_path = self.target.join(&rel_path);
            match path::classify(&source_path) {
                PathKind::Dir => {
                    if analysis.is_foldable(&rel_path) {
                        self.create_symlink(LinkKind::Dir, &source_path, &target_path)?;
                    } else if self.enter_target_dir(&target_path)? {
                        self.link_dir(&source_path, &rel_path, analysis)?;
                    }
                }
                PathKind::File | PathKind::Symlink => {
                    self.create_symlink(LinkKind::File, &source_path, &target_path)?;
                }
                PathKind::Missing | PathKind::Other => {
                    warn!("skipping unlinkable entry {:?}", source_path.display());
                }
            }
        }

        Ok(())
    }

    // Make sure the target path is a real directory we can recurse under.
    // Returns false when the subtree was skipped under the Skip policy.
    fn enter_target_dir(&mut self, target: &Path) -> Result<bool> {
        match path::classify(target) {
            PathKind::Missing => {
                path::ensure_dir_tree(target)?;
                Ok(true)
            }
            PathKind::Dir => Ok(true),
            // A non-directory sits where a real directory is needed. Never
            // replace it silently.
            _ => match self.options.conflict_resolution {
                ConflictPolicy::Fail => {
                    error!("existing entry conflicts with {:?}", target.display());
                    Err(LinkError::ConflictDetected {
                        target: target.into(),
                    })
                }
                ConflictPolicy::Skip => {
                    self.stats.files_skipped += 1;
                    Ok(false)
                }
                ConflictPolicy::Adopt | ConflictPolicy::Replace => {
                    if self.options.backup_conflicts {
                        self.backup(target)?;
                    } else {
                        remove_entry(target)?;
                    }
                    path::ensure_dir_tree(target)?;
                    self.stats.conflicts_resolved += 1;
                    Ok(true)
                }
            },
        }
    }

    fn create_symlink(&mut self, kind: LinkKind, source: &Path, target: &Path) -> Result<()> {
        let relative = path::make_relative(source, target);
        match path::classify(target) {
            PathKind::Missing => {
                self.place_link(kind, &relative, target)?;
                Ok(())
            }
            PathKind::Symlink => {
                let existing = path::read_link(target)?;
                if existing == relative {
                    // Already correct. Idempotence means zero mutations and
                    // zero counter increments.
                    return Ok(());
                }
                self.handle_conflict(kind, source, &relative, target)
            }
            PathKind::Dir => {
                if kind == LinkKind::Dir
                    && self.options.tree_folding == FoldStrategy::Aggressive
                    && analyze::all_entries_managed(
                        target,
                        &self.managed_root,
                        &self.options.ignore_patterns,
                    )
                {
                    // The directory holds nothing of the user's. Collapse it
                    // into a single directory symlink.
                    fs::remove_dir_all(target).map_err(|err| LinkError::RemoveEntry {
                        source: err,
                        path: target.into(),
                    })?;
                    self.place_link(kind, &relative, target)?;
                    return Ok(());
                }
                self.handle_conflict(kind, source, &relative, target)
            }
            PathKind::File | PathKind::Other => {
                self.handle_conflict(kind, source, &relative, target)
            }
        }
    }

    fn handle_conflict(
        &mut self,
        kind: LinkKind,
        source: &Path,
        relative: &Path,
        target: &Path,
    ) -> Result<()> {
        match self.options.conflict_resolution {
            ConflictPolicy::Fail => {
                error!("existing entry conflicts with {:?}", target.display());
                Err(LinkError::ConflictDetected {
                    target: target.into(),
                })
            }
            ConflictPolicy::Skip => {
                debug!("skipping conflicting entry {:?}", target.display());
                self.stats.files_skipped += 1;
                Ok(())
            }
            ConflictPolicy::Adopt => self.adopt(source, relative, target),
            ConflictPolicy::Replace => self.replace(kind, relative, target),
        }
    }

    // Import a pre-existing target entry into the source module, then link.
    fn adopt(&mut self, source: &Path, relative: &Path, target: &Path) -> Result<()> {
        if path::classify(target) == PathKind::Dir {
            let question = format!("Proceed with directory adoption of {:?}?", target.display());
            if !self
                .prompter
                .confirm(&question, false, self.options.force)
            {
                info!("declined directory adoption of {:?}", target.display());
                self.stats.files_skipped += 1;
                return Ok(());
            }

            // Merge target into source. Source wins on name collisions; the
            // losing target copy survives in the backup.
            if path::classify(source) == PathKind::Dir {
                self.merge_into_source(target, source)?;
            }

            if self.options.backup_conflicts {
                self.backup(target)?;
            } else {
                fs::remove_dir_all(target).map_err(|err| LinkError::RemoveEntry {
                    source: err,
                    path: target.into(),
                })?;
            }

            self.write_link(relative, target)?;
            self.stats.dirs_linked += 1;
            self.stats.conflicts_resolved += 1;
            return Ok(());
        }

        // File adoption.
        if self.options.backup_conflicts {
            self.backup(target)?;
        } else {
            remove_entry(target)?;
        }
        self.write_link(relative, target)?;
        self.stats.files_adopted += 1;
        self.stats.conflicts_resolved += 1;

        if self.options.verbose {
            info!("adopted {:?}", target.display());
        }

        Ok(())
    }

    fn replace(&mut self, kind: LinkKind, relative: &Path, target: &Path) -> Result<()> {
        if self.options.backup_conflicts {
            self.backup(target)?;
        } else {
            remove_entry(target)?;
        }

        self.place_link(kind, relative, target)?;
        self.stats.conflicts_resolved += 1;

        Ok(())
    }

    // Rename the target aside to its backup path, prompting before an
    // existing backup is overwritten.
    fn backup(&mut self, target: &Path) -> Result<()> {
        let backup = backup_path(target, &self.options.backup_suffix);
        if path::classify(&backup) != PathKind::Missing {
            let question = format!("Replace existing backup file {:?}?", backup.display());
            if !self
                .prompter
                .confirm(&question, false, self.options.force)
            {
                // The original target stays untouched.
                return Err(LinkError::BackupConflict { backup });
            }
            remove_entry(&backup)?;
        }

        fs::rename(target, &backup).map_err(|err| LinkError::WriteBackup {
            source: err,
            path: backup.clone(),
        })?;
        self.stats.backups_created += 1;

        if self.options.verbose {
            info!("backed up {:?} to {:?}", target.display(), backup.display());
        }

        Ok(())
    }

    // Copy everything under target_dir that is missing under source_dir.
    // This is the only place where the linker writes into the source tree.
    fn merge_into_source(&self, target_dir: &Path, source_dir: &Path) -> Result<()> {
        for entry in read_source_dir(target_dir)? {
            let (name, from) = entry?;
            if pattern::matches_any(&name, &self.options.ignore_patterns) {
                continue;
            }

            let to = source_dir.join(&name);
            match path::classify(&from) {
                PathKind::File => {
                    if path::classify(&to) == PathKind::Missing {
                        fs::copy(&from, &to).map_err(|err| LinkError::CopyEntry {
                            source: err,
                            path: from.clone(),
                        })?;
                    }
                }
                PathKind::Symlink => {
                    if path::classify(&to) == PathKind::Missing {
                        let text = path::read_link(&from)?;
                        symlink(&text, &to).map_err(|err| LinkError::CreateSymlink {
                            source: err,
                            path: to.clone(),
                        })?;
                    }
                }
                PathKind::Dir => match path::classify(&to) {
                    PathKind::Missing => copy_dir_tree(&from, &to)?,
                    PathKind::Dir => self.merge_into_source(&from, &to)?,
                    // Non-directory source entry wins; target copy is
                    // discarded by the backup rename.
                    _ => {}
                },
                PathKind::Missing | PathKind::Other => {}
            }
        }

        Ok(())
    }

    fn place_link(&mut self, kind: LinkKind, relative: &Path, target: &Path) -> Result<()> {
        self.write_link(relative, target)?;
        match kind {
            LinkKind::File => self.stats.files_linked += 1,
            LinkKind::Dir => self.stats.dirs_linked += 1,
        }

        if self.options.verbose {
            info!("linked {:?} -> {:?}", target.display(), relative.display());
        } else {
            debug!("linked {:?} -> {:?}", target.display(), relative.display());
        }

        Ok(())
    }

    fn write_link(&self, relative: &Path, target: &Path) -> Result<()> {
        symlink(relative, target).map_err(|err| LinkError::CreateSymlink {
            source: err,
            path: target.into(),
        })
    }

    fn unlink_dir(&mut self, dir: &Path, relative: &Path, removed: &mut usize) -> Result<()> {
        for entry in read_source_dir(dir)? {
            let (name, source_path) = entry?;
            if name == MODULE_DESCRIPTOR
                || pattern::matches_any(&name, &self.options.ignore_patterns)
            {
                continue;
            }

            let rel_path = relative.join(&name);
            let target_path = self.target.join(&rel_path);
            let expected = path::make_relative(&source_path, &target_path);

            match path::classify(&source_path) {
                PathKind::Dir => {
                    if path::classify(&target_path) == PathKind::Symlink {
                        self.remove_if_ours(&target_path, &expected, removed);
                    } else if path::classify(&target_path) == PathKind::Dir {
                        self.unlink_dir(&source_path, &rel_path, removed)?;
                    }
                }
                PathKind::File | PathKind::Symlink => {
                    if path::classify(&target_path) == PathKind::Symlink {
                        self.remove_if_ours(&target_path, &expected, removed);
                    }
                }
                PathKind::Missing | PathKind::Other => {}
            }
        }

        Ok(())
    }

    // Delete the symlink only when its literal text is exactly what link
    // would have written. Foreign links, absolute links included, survive.
    fn remove_if_ours(&self, target: &Path, expected: &Path, removed: &mut usize) {
        match path::read_link(target) {
            Ok(text) if text == *expected => {
                if let Err(err) = fs::remove_file(target) {
                    warn!("cannot remove {:?}: {err}", target.display());
                } else {
                    *removed += 1;
                }
            }
            Ok(_) => {}
            Err(err) => warn!("unreadable symlink during unlink: {err}"),
        }
    }
}

// Iterate a source directory, surfacing (base name, absolute path) pairs.
fn read_source_dir(
    dir: &Path,
) -> Result<impl Iterator<Item = Result<(String, PathBuf)>> + '_> {
    let entries = fs::read_dir(dir).map_err(|err| LinkError::SourceUnreadable {
        source: err,
        path: dir.into(),
    })?;

    Ok(entries.map(move |entry| {
        let entry = entry.map_err(|err| LinkError::SourceUnreadable {
            source: err,
            path: dir.into(),
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        Ok((name, path))
    }))
}

// Backup path is target + "." + suffix, with the suffix's leading dot
// normalized so "bkp" and ".bkp" name the same file.
fn backup_path(target: &Path, suffix: &str) -> PathBuf {
    let suffix = suffix.trim_start_matches('.');
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    target.with_file_name(format!("{name}.{suffix}"))
}

fn remove_entry(path: &Path) -> Result<()> {
    let result = if path::classify(path) == PathKind::Dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|err| LinkError::RemoveEntry {
        source: err,
        path: path.into(),
    })
}

fn copy_dir_tree(from: &Path, to: &Path) -> Result<()> {
    path::ensure_dir_tree(to)?;
    for entry in read_source_dir(from)? {
        let (name, entry_path) = entry?;
        let destination = to.join(&name);
        match path::classify(&entry_path) {
            PathKind::File => {
                fs::copy(&entry_path, &destination).map_err(|err| LinkError::CopyEntry {
                    source: err,
                    path: entry_path.clone(),
                })?;
            }
            PathKind::Symlink => {
                let text = path::read_link(&entry_path)?;
                symlink(&text, &destination).map_err(|err| LinkError::CreateSymlink {
                    source: err,
                    path: destination.clone(),
                })?;
            }
            PathKind::Dir => copy_dir_tree(&entry_path, &destination)?,
            PathKind::Missing | PathKind::Other => {}
        }
    }

    Ok(())
}

/// Linking engine error types.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The `Fail` policy saw a pre-existing entry in the way.
    #[error("existing entry conflicts with {:?}", target.display())]
    ConflictDetected { target: PathBuf },

    /// An existing backup would be overwritten and the answer was no.
    #[error("backup already exists at {:?}", backup.display())]
    BackupConflict { backup: PathBuf },

    /// Source subtree cannot be opened.
    #[error("failed to read source tree at {:?}", path.display())]
    SourceUnreadable {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Symlink cannot be created.
    #[error("failed to create symlink at {:?}", path.display())]
    CreateSymlink {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Pre-existing entry cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    RemoveEntry {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Backup cannot be written.
    #[error("failed to write backup at {:?}", path.display())]
    WriteBackup {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Entry cannot be copied during adoption.
    #[error("failed to copy {:?}", path.display())]
    CopyEntry {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Path resolution fails.
    #[error(transparent)]
    Path(#[from] crate::path::PathError),

    /// Tree analysis fails.
    #[error(transparent)]
    Analyze(#[from] analyze::AnalyzeError),
}

/// Friendly result alias :3
pub type Result<T, E = LinkError> = std::result::Result<T, E>;
