// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Module deployment.
//!
//! The deployer drives the linking engine across every module the scanner
//! discovered. Modules are processed in sorted name order, each against its
//! own effective target: the module's `target_dir` override when present,
//! the global target base otherwise. Per-module failures are reported and do
//! not abort the batch, so one broken module never blocks the rest of a
//! deployment.

use crate::{
    linker::{ConsolePrompter, Linker, LinkerOptions, LinkError, LinkingStats, ForceMode, PromptHandler},
    path::{self, PathKind},
    scanner::{ConflictInfo, Module, ModuleScanner, ScanError, MODULE_DESCRIPTOR},
};

use crate::config::ConflictPolicy;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// Aggregate outcome of one deployment batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeployReport {
    /// Modules considered, not counting ignored ones.
    pub processed: usize,

    /// Modules linked successfully.
    pub deployed: usize,

    /// Modules skipped over an unusable target or unresolvable conflict.
    pub skipped: usize,

    /// Modules that failed outright.
    pub failed: usize,

    /// Combined linking counters across all deployed modules.
    pub stats: LinkingStats,
}

impl DeployReport {
    /// Check if any module in the batch failed.
    pub fn is_partial(&self) -> bool {
        self.failed > 0 || self.skipped > 0
    }
}

impl Display for DeployReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{}/{} modules deployed ({} skipped, {} failed): {}",
            self.deployed, self.processed, self.skipped, self.failed, self.stats,
        )
    }
}

/// Deploy discovered modules through the linking engine.
#[derive(Debug)]
pub struct Deployer<P = ConsolePrompter>
where
    P: PromptHandler + Clone,
{
    scanner: ModuleScanner,
    target_base: PathBuf,
    options: LinkerOptions,
    prompter: P,
}

impl<P> Deployer<P>
where
    P: PromptHandler + Clone,
{
    /// Construct new deployer.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Path`] if the target base cannot be
    ///   canonicalized.
    pub fn new(
        scanner: ModuleScanner,
        target_base: impl AsRef<Path>,
        options: LinkerOptions,
        prompter: P,
    ) -> Result<Self> {
        Ok(Self {
            scanner,
            target_base: path::canonicalize(target_base)?,
            options,
            prompter,
        })
    }

    /// Deploy every non-ignored module under the source root.
    ///
    /// Returns a report even when some modules failed; callers decide how
    /// partial success maps to an exit code. The only error that aborts the
    /// whole batch is a backup conflict under [`ForceMode::No`], which is a
    /// user-requested abort.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Scan`] if module discovery fails.
    /// - Return [`DeployError::Link`] on a user-requested abort.
    #[instrument(skip(self), level = "debug")]
    pub fn deploy(&mut self) -> Result<DeployReport> {
        let modules = self.scanner.scan()?;
        let mut report = DeployReport::default();

        for module in &modules {
            if module.ignore {
                debug!("module {:?} is marked ignore", module.name);
                continue;
            }

            report.processed += 1;
            self.apply(module, &mut report, Linker::link)?;
        }

        info!("{report}");
        Ok(report)
    }

    /// Link the named modules only.
    ///
    /// Naming a module explicitly overrides its `ignore` flag.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::ModuleNotFound`] if any name is unknown.
    pub fn link_modules(&mut self, names: &[String]) -> Result<DeployReport> {
        let modules = self.select(names)?;
        let mut report = DeployReport::default();
        for module in &modules {
            report.processed += 1;
            self.apply(module, &mut report, Linker::link)?;
        }

        info!("{report}");
        Ok(report)
    }

    /// Unlink the named modules only.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::ModuleNotFound`] if any name is unknown.
    pub fn unlink_modules(&mut self, names: &[String]) -> Result<DeployReport> {
        let modules = self.select(names)?;
        let mut report = DeployReport::default();
        for module in &modules {
            report.processed += 1;
            match self.run_unlink(module) {
                Ok(removed) => {
                    report.deployed += 1;
                    info!("unlinked module {:?}: removed {removed} links", module.name);
                }
                Err(err) => {
                    error!("module {:?} failed: {err}", module.name);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Unlink then link the named modules.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::ModuleNotFound`] if any name is unknown.
    pub fn relink_modules(&mut self, names: &[String]) -> Result<DeployReport> {
        let modules = self.select(names)?;
        let mut report = DeployReport::default();
        for module in &modules {
            report.processed += 1;
            if let Err(err) = self.run_unlink(module) {
                error!("module {:?} failed: {err}", module.name);
                report.failed += 1;
                continue;
            }
            self.apply(module, &mut report, Linker::link)?;
        }

        info!("{report}");
        Ok(report)
    }

    /// Scan and describe all discovered modules with conflict previews.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Scan`] if module discovery fails.
    pub fn status(&self) -> Result<Vec<(Module, Option<ConflictInfo>)>> {
        let modules = self.scanner.scan()?;
        let mut listing = Vec::with_capacity(modules.len());
        for module in modules {
            let target = match self.effective_target(&module) {
                Ok(target) => target,
                Err(_) => {
                    listing.push((module, None));
                    continue;
                }
            };
            let conflict = self.scanner.preview_conflict(&module, &target);
            listing.push((module, conflict));
        }

        Ok(listing)
    }

    fn select(&self, names: &[String]) -> Result<Vec<Module>> {
        let modules = self.scanner.scan()?;
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let module = modules
                .iter()
                .find(|module| &module.name == name)
                .cloned()
                .ok_or_else(|| DeployError::ModuleNotFound { name: name.clone() })?;
            selected.push(module);
        }

        Ok(selected)
    }

    // Run one module through the linker, folding the outcome into the
    // report. Only a user-requested abort propagates.
    fn apply(
        &mut self,
        module: &Module,
        report: &mut DeployReport,
        operation: fn(&mut Linker<P>) -> crate::linker::Result<()>,
    ) -> Result<()> {
        match self.run(module, operation) {
            Ok(Some(stats)) => {
                report.deployed += 1;
                report.stats.merge(&stats);
                Ok(())
            }
            Ok(None) => {
                report.skipped += 1;
                Ok(())
            }
            Err(err) => {
                if self.user_abort(&err) {
                    return Err(err);
                }
                error!("module {:?} failed: {err}", module.name);
                report.failed += 1;
                Ok(())
            }
        }
    }

    fn run(
        &mut self,
        module: &Module,
        operation: fn(&mut Linker<P>) -> crate::linker::Result<()>,
    ) -> Result<Option<LinkingStats>> {
        let Some(target) = self.usable_target(module)? else {
            return Ok(None);
        };

        if let Some(conflict) = self.scanner.preview_conflict(module, &target) {
            if !self.allows_resolution() {
                warn!("skipping module {:?}: {conflict}", module.name);
                return Ok(None);
            }
        }

        let mut linker = Linker::new(
            &module.path,
            &target,
            self.options.clone(),
            self.prompter.clone(),
        )?
        .with_managed_root(self.scanner.source_root());
        operation(&mut linker)?;

        Ok(Some(*linker.stats()))
    }

    fn run_unlink(&mut self, module: &Module) -> Result<usize> {
        let Some(target) = self.usable_target(module)? else {
            return Ok(0);
        };

        let mut linker = Linker::new(
            &module.path,
            &target,
            self.options.clone(),
            self.prompter.clone(),
        )?
        .with_managed_root(self.scanner.source_root());

        Ok(linker.unlink()?)
    }

    // Expand the module's target override and make sure it is an existing
    // writable directory. An unusable target skips the module, it does not
    // fail the batch.
    fn usable_target(&self, module: &Module) -> Result<Option<PathBuf>> {
        let target = self.effective_target(module)?;
        if path::classify(&target) != PathKind::Dir {
            warn!(
                "skipping module {:?}: target {:?} is not a directory",
                module.name,
                target.display()
            );
            return Ok(None);
        }

        let readonly = fs::metadata(&target)
            .map(|meta| meta.permissions().readonly())
            .unwrap_or(true);
        if readonly {
            warn!(
                "skipping module {:?}: target {:?} is not writable",
                module.name,
                target.display()
            );
            return Ok(None);
        }

        Ok(Some(target))
    }

    fn effective_target(&self, module: &Module) -> Result<PathBuf> {
        match &module.target_dir {
            Some(raw) => Ok(path::expand(raw)?),
            None => Ok(self.target_base.clone()),
        }
    }

    // Resolution is disallowed only when the policy is still the Fail
    // default and nothing forces the issue.
    fn allows_resolution(&self) -> bool {
        self.options.conflict_resolution != ConflictPolicy::Fail
            || self.options.force != ForceMode::None
    }

    fn user_abort(&self, err: &DeployError) -> bool {
        matches!(err, DeployError::Link(LinkError::BackupConflict { .. }))
            && self.options.force == ForceMode::No
    }
}

/// Unlink a single named module without explicit source and target roots.
///
/// Covers the bare `ndmgr unlink <name>` invocation: either the name is a
/// top-level symlink to remove, or it is a module directory whose deployed
/// symlinks must be hunted down under the effective target.
#[derive(Debug, Clone)]
pub struct SimpleUnlinker {
    base: PathBuf,
}

impl SimpleUnlinker {
    /// Construct new simple unlinker resolving names against `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Remove whatever links the named module has deployed.
    ///
    /// Walks the effective target directory and deletes every symlink whose
    /// destination lies under the module directory. Relative link text is
    /// resolved before the comparison; absolute link text is compared
    /// literally. The walk never follows symlinked directories, which
    /// bounds traversal in the presence of cyclic links.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Path`] if the module path cannot be resolved
    ///   or no home directory exists for the default target.
    #[instrument(skip(self), level = "debug")]
    pub fn unlink(&self, name: &str) -> Result<usize> {
        let module_path = self.base.join(name);
        match path::classify(&module_path) {
            PathKind::Missing => {
                warn!("nothing to unlink: {:?} does not exist", module_path.display());
                Ok(0)
            }
            PathKind::Symlink => {
                fs::remove_file(&module_path).map_err(|err| DeployError::RemoveEntry {
                    source: err,
                    path: module_path.clone(),
                })?;
                info!("removed top-level symlink {:?}", module_path.display());
                Ok(1)
            }
            PathKind::Dir => self.unlink_module_dir(&module_path),
            PathKind::File | PathKind::Other => {
                warn!(
                    "nothing to unlink: {:?} is neither symlink nor module directory",
                    module_path.display()
                );
                Ok(0)
            }
        }
    }

    fn unlink_module_dir(&self, module_path: &Path) -> Result<usize> {
        let target = self.effective_target(module_path)?;
        let module_abs = path::canonicalize(module_path)?;

        let mut removed = 0;
        for entry in WalkDir::new(&target).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("unreadable entry during unlink: {err}");
                    continue;
                }
            };
            if !entry.path_is_symlink() {
                continue;
            }

            let Ok(text) = path::read_link(entry.path()) else {
                warn!("unreadable symlink at {:?}", entry.path().display());
                continue;
            };
            let destination = if text.is_absolute() {
                text
            } else {
                let Some(parent) = entry.path().parent() else {
                    continue;
                };
                match path::canonicalize(parent.join(text)) {
                    Ok(resolved) => resolved,
                    Err(_) => continue,
                }
            };

            if destination.starts_with(&module_abs) {
                fs::remove_file(entry.path()).map_err(|err| DeployError::RemoveEntry {
                    source: err,
                    path: entry.path().into(),
                })?;
                debug!("removed {:?}", entry.path().display());
                removed += 1;
            }
        }

        info!("removed {removed} links pointing into {:?}", module_abs.display());
        Ok(removed)
    }

    // The module's descriptor may override where its links were deployed.
    // Without an override the user's home directory is the target.
    fn effective_target(&self, module_path: &Path) -> Result<PathBuf> {
        let descriptor_path = module_path.join(MODULE_DESCRIPTOR);
        if descriptor_path.is_file() {
            if let Ok(data) = fs::read_to_string(&descriptor_path) {
                let descriptor: crate::scanner::ModuleDescriptor =
                    data.parse().unwrap_or_default();
                if let Some(raw) = descriptor.target_dir {
                    return Ok(path::expand(raw)?);
                }
            }
        }

        Ok(path::home_dir()?)
    }
}

/// Deployment error types.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Named module is not under the source root.
    #[error("module {name:?} not found under source root")]
    ModuleNotFound { name: String },

    /// Deployed entry cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    RemoveEntry {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Module discovery fails.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Linking engine fails.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Path resolution fails.
    #[error(transparent)]
    Path(#[from] crate::path::PathError),
}

/// Friendly result alias :3
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::ScriptedPrompter;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::symlink;

    struct Fixture {
        temp: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let temp = tempfile::tempdir()?;
            fs::create_dir(temp.path().join("src"))?;
            fs::create_dir(temp.path().join("tgt"))?;

            Ok(Self { temp })
        }

        fn source(&self) -> PathBuf {
            self.temp.path().join("src")
        }

        fn target(&self) -> PathBuf {
            self.temp.path().join("tgt")
        }

        fn module(&self, name: &str, descriptor: &str, files: &[(&str, &str)]) -> anyhow::Result<()> {
            let dir = self.source().join(name);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(MODULE_DESCRIPTOR), descriptor)?;
            for (relative, contents) in files {
                let path = dir.join(relative);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, contents)?;
            }

            Ok(())
        }

        fn deployer(&self, options: LinkerOptions) -> anyhow::Result<Deployer<ScriptedPrompter>> {
            let scanner = ModuleScanner::new(self.source(), 1, Vec::<String>::new())?;
            Ok(Deployer::new(
                scanner,
                self.target(),
                options,
                ScriptedPrompter::always_yes(),
            )?)
        }
    }

    #[test]
    fn deploy_links_every_module() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module("vim", "", &[(".vimrc", "set nocompatible")])?;
        fixture.module("bash", "", &[(".bashrc", "export EDITOR=vim")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let report = deployer.deploy()?;

        assert_eq!(report.processed, 2);
        assert_eq!(report.deployed, 2);
        assert_eq!(report.stats.files_linked, 2);
        assert!(path::is_symlink(fixture.target().join(".vimrc")));
        assert!(path::is_symlink(fixture.target().join(".bashrc")));

        Ok(())
    }

    #[test]
    fn ignored_modules_are_not_processed() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module("vim", "ignore = true", &[(".vimrc", "managed")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let report = deployer.deploy()?;

        assert_eq!(report.processed, 0);
        assert_eq!(
            path::classify(fixture.target().join(".vimrc")),
            PathKind::Missing
        );

        Ok(())
    }

    #[test]
    fn explicit_link_overrides_ignore_flag() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module("vim", "ignore = true", &[(".vimrc", "managed")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let report = deployer.link_modules(&["vim".to_string()])?;

        assert_eq!(report.deployed, 1);
        assert!(path::is_symlink(fixture.target().join(".vimrc")));

        Ok(())
    }

    #[test]
    fn target_dir_override_redirects_module() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let other = fixture.temp.path().join("other");
        fs::create_dir(&other)?;
        let descriptor = format!("target_dir = {}", other.display());
        fixture.module("vim", &descriptor, &[(".vimrc", "managed")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let report = deployer.deploy()?;

        assert_eq!(report.deployed, 1);
        assert!(path::is_symlink(other.join(".vimrc")));
        assert_eq!(
            path::classify(fixture.target().join(".vimrc")),
            PathKind::Missing
        );

        Ok(())
    }

    #[test]
    fn missing_target_skips_module_without_failing_batch() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module(
            "vim",
            "target_dir = /nonexistent/nowhere",
            &[(".vimrc", "managed")],
        )?;
        fixture.module("bash", "", &[(".bashrc", "managed")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let report = deployer.deploy()?;

        assert_eq!(report.processed, 2);
        assert_eq!(report.deployed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);

        Ok(())
    }

    #[test]
    fn preview_conflict_skips_module_under_default_policy() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module("vim", "", &[(".vimrc", "managed")])?;
        // Something foreign squats on the module's preview path.
        fs::write(fixture.target().join("vim"), "in the way")?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let report = deployer.deploy()?;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.deployed, 0);

        Ok(())
    }

    #[test]
    fn unknown_module_name_is_an_error() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module("vim", "", &[(".vimrc", "managed")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        let result = deployer.link_modules(&["nope".to_string()]);

        assert!(matches!(
            result,
            Err(DeployError::ModuleNotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn relink_repairs_stale_links() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.module("vim", "", &[(".vimrc", "managed")])?;

        let mut deployer = fixture.deployer(LinkerOptions::default())?;
        deployer.deploy()?;

        let report = deployer.relink_modules(&["vim".to_string()])?;
        assert_eq!(report.deployed, 1);
        assert!(path::is_symlink(fixture.target().join(".vimrc")));

        Ok(())
    }

    #[test]
    fn simple_unlink_removes_top_level_symlink() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let link = fixture.temp.path().join("vim");
        symlink(fixture.source(), &link)?;

        let unlinker = SimpleUnlinker::new(fixture.temp.path());
        assert_eq!(unlinker.unlink("vim")?, 1);
        assert_eq!(path::classify(&link), PathKind::Missing);

        Ok(())
    }

    #[test]
    fn simple_unlink_missing_module_is_a_noop() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let unlinker = SimpleUnlinker::new(fixture.temp.path());
        assert_eq!(unlinker.unlink("ghost")?, 0);

        Ok(())
    }

    #[test]
    fn simple_unlink_hunts_links_into_module_dir() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let descriptor = format!("target_dir = {}", fixture.target().display());
        fixture.module("vim", &descriptor, &[(".vimrc", "managed")])?;

        let module = fixture.source().join("vim");
        // One of ours (relative), one of ours (absolute), one foreign.
        fs::create_dir_all(fixture.target().join("nested"))?;
        symlink("../src/vim/.vimrc", fixture.target().join(".vimrc"))?;
        symlink(module.join(".vimrc"), fixture.target().join("nested/.vimrc"))?;
        symlink("/etc/passwd", fixture.target().join("foreign"))?;

        let unlinker = SimpleUnlinker::new(fixture.source());
        let removed = unlinker.unlink("vim")?;

        assert_eq!(removed, 2);
        assert_eq!(
            path::classify(fixture.target().join(".vimrc")),
            PathKind::Missing
        );
        assert_eq!(
            path::classify(fixture.target().join("nested/.vimrc")),
            PathKind::Missing
        );
        assert!(path::is_symlink(fixture.target().join("foreign")));

        Ok(())
    }
}
