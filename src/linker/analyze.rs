// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tree folding analysis.
//!
//! Before a module is linked, the analyzer inspects every directory under
//! the module and decides whether the corresponding target directory can be
//! __folded__, i.e., represented by a single directory symlink instead of a
//! real directory full of file symlinks. All fold decisions are made up
//! front so the linker never has to reconsider one mid-traversal.
//!
//! # Folding Strategies
//!
//! Under the conservative `Directory` strategy a real pre-existing target
//! directory is never folded. Under `Aggressive`, a target directory may
//! additionally be folded when it is empty or when everything inside it is a
//! symlink pointing back into the managed source root, meaning the content
//! is ours already. Mixed or foreign content always forces file-level
//! linking.

use crate::{
    config::{ConflictPolicy, FoldStrategy},
    path::{self, PathKind},
    pattern,
    scanner::MODULE_DESCRIPTOR,
};

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Fold decisions for one module, keyed by module-relative directory path.
///
/// Constructed at the start of link, consumed by the linker, discarded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeAnalysis {
    foldable: HashMap<PathBuf, bool>,
}

impl TreeAnalysis {
    /// Check whether the directory at a module-relative path may be folded.
    ///
    /// Paths the analyzer never visited are reported unfoldable.
    pub fn is_foldable(&self, relative: impl AsRef<Path>) -> bool {
        self.foldable
            .get(relative.as_ref())
            .copied()
            .unwrap_or(false)
    }

    /// Number of directories analyzed.
    pub fn len(&self) -> usize {
        self.foldable.len()
    }

    /// Check if no directories were analyzed at all.
    pub fn is_empty(&self) -> bool {
        self.foldable.is_empty()
    }
}

/// Analyze one module against one target base.
#[derive(Debug)]
pub struct TreeAnalyzer<'a> {
    target_base: &'a Path,
    managed_root: &'a Path,
    strategy: FoldStrategy,
    policy: ConflictPolicy,
    ignore_patterns: &'a [String],
    visited: HashSet<PathBuf>,
}

impl<'a> TreeAnalyzer<'a> {
    /// Construct new analyzer.
    ///
    /// `managed_root` is the source root that marks symlink destinations as
    /// already-managed content for aggressive folding.
    pub fn new(
        target_base: &'a Path,
        managed_root: &'a Path,
        strategy: FoldStrategy,
        policy: ConflictPolicy,
        ignore_patterns: &'a [String],
    ) -> Self {
        Self {
            target_base,
            managed_root,
            strategy,
            policy,
            ignore_patterns,
            visited: HashSet::new(),
        }
    }

    /// Build the fold map for every directory under `module_root`.
    ///
    /// Recursion stops at foldable directories, because their whole subtree
    /// will be linked as one unit. Visited canonical paths are tracked so
    /// cyclic symlink chains inside the source tree terminate.
    ///
    /// # Errors
    ///
    /// - Return [`AnalyzeError::SourceUnreadable`] if a source directory
    ///   cannot be opened.
    #[instrument(skip(self, module_root), level = "debug")]
    pub fn analyze(mut self, module_root: &Path) -> Result<TreeAnalysis> {
        let mut analysis = TreeAnalysis::default();
        self.analyze_dir(module_root, Path::new(""), &mut analysis)?;
        debug!("analyzed {} directories", analysis.len());

        Ok(analysis)
    }

    fn analyze_dir(
        &mut self,
        source_dir: &Path,
        relative: &Path,
        analysis: &mut TreeAnalysis,
    ) -> Result<()> {
        // INVARIANT: Never revisit a canonical directory, or cyclic symlinks
        // would recurse forever.
        let canonical = path::canonicalize(source_dir)?;
        if !self.visited.insert(canonical) {
            return Ok(());
        }

        let entries = fs::read_dir(source_dir).map_err(|err| AnalyzeError::SourceUnreadable {
            source: err,
            path: source_dir.into(),
        })?;

        for entry in entries {
            let entry = entry.map_err(|err| AnalyzeError::SourceUnreadable {
                source: err,
                path: source_dir.into(),
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MODULE_DESCRIPTOR || pattern::matches_any(&name, self.ignore_patterns) {
                continue;
            }

            let source_path = entry.path();
            if path::classify(&source_path) != PathKind::Dir {
                continue;
            }

            let rel_path = relative.join(&name);
            let foldable = self.decide(&self.target_base.join(&rel_path));
            analysis.foldable.insert(rel_path.clone(), foldable);

            if !foldable {
                self.analyze_dir(&source_path, &rel_path, analysis)?;
            }
        }

        Ok(())
    }

    fn decide(&self, target: &Path) -> bool {
        match path::classify(target) {
            // A stale link will be replaced, a correct one recognized.
            PathKind::Missing | PathKind::Symlink => true,
            PathKind::Dir => {
                // Adoption folds at directory level so the whole target
                // directory can be merged into the source.
                if self.policy == ConflictPolicy::Adopt {
                    return true;
                }

                match self.strategy {
                    FoldStrategy::Directory => false,
                    FoldStrategy::Aggressive => {
                        all_entries_managed(target, self.managed_root, self.ignore_patterns)
                    }
                }
            }
            PathKind::File | PathKind::Other => false,
        }
    }
}

/// Check if a target directory holds nothing but already-managed content.
///
/// True when the directory is empty, or when every non-ignored entry is a
/// symlink whose destination resolves under `managed_root`.
pub(crate) fn all_entries_managed(
    dir: &Path,
    managed_root: &Path,
    ignore_patterns: &[String],
) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern::matches_any(&name, ignore_patterns) {
            continue;
        }

        let entry_path = entry.path();
        if path::classify(&entry_path) != PathKind::Symlink {
            return false;
        }

        let Ok(link_target) = path::read_link(&entry_path) else {
            return false;
        };
        let destination = if link_target.is_absolute() {
            link_target
        } else {
            match entry_path.parent() {
                Some(parent) => parent.join(link_target),
                None => return false,
            }
        };

        match path::canonicalize(destination) {
            Ok(resolved) if resolved.starts_with(managed_root) => continue,
            _ => return false,
        }
    }

    true
}

/// Tree analysis error types.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
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
pub type Result<T, E = AnalyzeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn analyzer<'a>(
        target: &'a Path,
        managed: &'a Path,
        strategy: FoldStrategy,
        policy: ConflictPolicy,
    ) -> TreeAnalyzer<'a> {
        TreeAnalyzer::new(target, managed, strategy, policy, &[])
    }

    #[test]
    fn missing_target_is_foldable_under_both_strategies() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf"))?;
        fs::create_dir(&target)?;

        for strategy in [FoldStrategy::Directory, FoldStrategy::Aggressive] {
            let analysis = analyzer(
                &target,
                temp.path(),
                strategy,
                ConflictPolicy::Fail,
            )
            .analyze(&source)?;
            assert!(analysis.is_foldable("conf"));
        }

        Ok(())
    }

    #[test]
    fn existing_directory_is_conservative_under_directory_strategy() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf/nested"))?;
        fs::create_dir_all(target.join("conf"))?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Directory,
            ConflictPolicy::Fail,
        )
        .analyze(&source)?;

        assert!(!analysis.is_foldable("conf"));
        // Unfoldable parents get their children analyzed too.
        assert!(analysis.is_foldable("conf/nested"));

        Ok(())
    }

    #[test]
    fn aggressive_folds_empty_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf"))?;
        fs::create_dir_all(target.join("conf"))?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Aggressive,
            ConflictPolicy::Fail,
        )
        .analyze(&source)?;

        assert!(analysis.is_foldable("conf"));

        Ok(())
    }

    #[test]
    fn aggressive_folds_fully_managed_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf"))?;
        fs::write(source.join("conf/app.ini"), "managed")?;
        fs::create_dir_all(target.join("conf"))?;
        symlink(source.join("conf/app.ini"), target.join("conf/app.ini"))?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Aggressive,
            ConflictPolicy::Fail,
        )
        .analyze(&source)?;

        assert!(analysis.is_foldable("conf"));

        Ok(())
    }

    #[test]
    fn aggressive_refuses_foreign_content() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf"))?;
        fs::create_dir_all(target.join("conf"))?;
        fs::write(target.join("conf/user.ini"), "foreign")?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Aggressive,
            ConflictPolicy::Fail,
        )
        .analyze(&source)?;

        assert!(!analysis.is_foldable("conf"));

        Ok(())
    }

    #[test]
    fn ignored_names_do_not_count_as_foreign() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf"))?;
        fs::create_dir_all(target.join("conf"))?;
        fs::write(target.join("conf/junk.swp"), "editor droppings")?;

        let patterns = vec!["*.swp".to_string()];
        let analysis = TreeAnalyzer::new(
            &target,
            temp.path(),
            FoldStrategy::Aggressive,
            ConflictPolicy::Fail,
            &patterns,
        )
        .analyze(&source)?;

        assert!(analysis.is_foldable("conf"));

        Ok(())
    }

    #[test]
    fn adopt_folds_existing_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("data"))?;
        fs::create_dir_all(target.join("data"))?;
        fs::write(target.join("data/user.txt"), "user data")?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Directory,
            ConflictPolicy::Adopt,
        )
        .analyze(&source)?;

        assert!(analysis.is_foldable("data"));

        Ok(())
    }

    #[test]
    fn file_in_the_way_is_never_foldable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("conf"))?;
        fs::create_dir(&target)?;
        fs::write(target.join("conf"), "a file, not a directory")?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Aggressive,
            ConflictPolicy::Fail,
        )
        .analyze(&source)?;

        assert!(!analysis.is_foldable("conf"));

        Ok(())
    }

    #[test]
    fn cyclic_source_symlinks_terminate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("src/mod");
        let target = temp.path().join("tgt");
        fs::create_dir_all(source.join("sub"))?;
        fs::create_dir(&target)?;
        // sub/loop points back at the module root.
        symlink(&source, source.join("sub/loop"))?;

        let analysis = analyzer(
            &target,
            temp.path(),
            FoldStrategy::Directory,
            ConflictPolicy::Fail,
        )
        .analyze(&source)?;

        assert!(analysis.len() >= 1);

        Ok(())
    }
}
