// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tracked repository coordination.
//!
//! Modules are backed by version-controlled repositories so the same
//! dotfiles can be synchronized across machines. The linking core never
//! touches git; everything version-control shaped goes through the [`Vcs`]
//! trait defined here, with [`Git2Vcs`] as the libgit2-backed
//! implementation.
//!
//! # Synchronization
//!
//! The [`RepoManager`] drives the `[[repository]]` table from the global
//! configuration: clone-if-missing, branch switch, optional auto-commit
//! with a templated message, pull, push. Repositories synchronize
//! concurrently on blocking tasks, with clone progress rendered through a
//! shared progress bar set.

use crate::config::{GitConflictPolicy, GitSettings, RepositoryEntry};

use auth_git2::{GitAuthenticator, Prompter};
use futures::future::join_all;
use git2::{build::RepoBuilder, FetchOptions, RemoteCallbacks, Repository};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use inquire::{Confirm, Password, Text};
use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, instrument, warn};

/// Version control capability required by the sync workflow.
pub trait Vcs: Send + Sync {
    /// Check if a repository exists at the path.
    fn is_repo(&self, path: &Path) -> bool;

    /// Clone a remote repository to the path.
    fn clone_repo(&self, remote: &str, path: &Path, branch: Option<&str>) -> Result<()>;

    /// Fetch and integrate remote history.
    fn pull(&self, path: &Path, branch: Option<&str>) -> Result<PullOutcome>;

    /// Publish local history to the remote.
    fn push(&self, path: &Path, branch: Option<&str>, force: bool) -> Result<()>;

    /// Check if the working tree has uncommitted changes.
    fn has_changes(&self, path: &Path) -> Result<bool>;

    /// Record a commit, staging everything first when `add_all` is set.
    fn commit(&self, path: &Path, message: &str, add_all: bool) -> Result<()>;

    /// Switch to a branch, creating it from HEAD when `create` is set.
    fn switch_branch(&self, path: &Path, branch: &str, create: bool) -> Result<()>;
}

/// How a pull resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Local history already matched the remote.
    UpToDate,

    /// Local history fast-forwarded onto the remote.
    FastForward,

    /// Histories diverged and local history was kept. The caller should
    /// force push to publish it.
    KeptLocal,

    /// Histories diverged and local history was discarded for the remote's.
    ResetToRemote,
}

/// Version control through libgit2.
pub struct Git2Vcs {
    policy: GitConflictPolicy,
    bars: MultiProgress,
}

impl Git2Vcs {
    /// Construct new libgit2 backend resolving divergence under `policy`.
    pub fn new(policy: GitConflictPolicy) -> Self {
        Self {
            policy,
            bars: MultiProgress::new(),
        }
    }

    fn open(&self, path: &Path) -> Result<Repository> {
        Ok(Repository::open(path)?)
    }

    // Name of the branch to operate on: the explicit request, or whatever
    // HEAD points at.
    fn branch_name(&self, repo: &Repository, branch: Option<&str>) -> Result<String> {
        if let Some(branch) = branch {
            return Ok(branch.to_string());
        }

        let head = repo.head()?;
        head.shorthand()
            .map(str::to_owned)
            .ok_or(RepoError::DetachedHead)
    }
}

// Fetch options wired up with credential prompting and transfer progress.
// The authenticator and config outlive the returned options at the caller.
fn fetch_options<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a git2::Config,
    bar: ProgressBar,
) -> Result<FetchOptions<'a>> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-=> ");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut throttle = Instant::now();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(authenticator.credentials(config));
    callbacks.transfer_progress(move |progress| {
        let stats = progress.to_owned();
        if throttle.elapsed() > Duration::from_millis(10) {
            throttle = Instant::now();
            bar.set_length(stats.total_objects() as u64);
            bar.set_position(stats.received_objects() as u64);
        }
        true
    });

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);

    Ok(options)
}

impl Vcs for Git2Vcs {
    fn is_repo(&self, path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    #[instrument(skip(self), level = "debug")]
    fn clone_repo(&self, remote: &str, path: &Path, branch: Option<&str>) -> Result<()> {
        info!("clone {remote} into {:?}", path.display());
        let bar = self.bars.add(ProgressBar::no_length());
        bar.set_message(remote.to_string());

        let prompter = SuspendingPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = git2::Config::open_default()?;

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options(&authenticator, &config, bar.clone())?);
        if let Some(branch) = branch {
            builder.branch(branch);
        }
        builder.clone(remote, path)?;
        bar.finish();

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn pull(&self, path: &Path, branch: Option<&str>) -> Result<PullOutcome> {
        let repo = self.open(path)?;
        let branch = self.branch_name(&repo, branch)?;

        let bar = self.bars.add(ProgressBar::no_length());
        bar.set_message(format!("fetch {branch}"));
        let prompter = SuspendingPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = git2::Config::open_default()?;

        let mut remote = repo.find_remote("origin")?;
        remote.fetch(
            &[branch.as_str()],
            Some(&mut fetch_options(&authenticator, &config, bar.clone())?),
            None,
        )?;
        bar.finish_and_clear();

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let fetched = repo.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repo.merge_analysis(&[&fetched])?;

        if analysis.is_up_to_date() {
            debug!("{:?} already up to date", path.display());
            return Ok(PullOutcome::UpToDate);
        }

        if analysis.is_fast_forward() {
            let refname = format!("refs/heads/{branch}");
            let mut reference = repo.find_reference(&refname)?;
            reference.set_target(fetched.id(), "fast-forward pull")?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            info!("fast-forwarded {:?}", path.display());
            return Ok(PullOutcome::FastForward);
        }

        // Diverged history. Resolve under the configured policy.
        let keep_local = match self.policy {
            GitConflictPolicy::Local => true,
            GitConflictPolicy::Remote => false,
            GitConflictPolicy::Ask => Confirm::new(&format!(
                "History of {:?} diverged from remote. Keep local history?",
                path.display()
            ))
            .with_default(false)
            .prompt()
            .unwrap_or(false),
        };

        if keep_local {
            warn!("keeping diverged local history in {:?}", path.display());
            return Ok(PullOutcome::KeptLocal);
        }

        let commit = repo.find_commit(fetched.id())?;
        repo.reset(commit.as_object(), git2::ResetType::Hard, None)?;
        warn!("reset {:?} to remote history", path.display());

        Ok(PullOutcome::ResetToRemote)
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self, path: &Path, branch: Option<&str>, force: bool) -> Result<()> {
        let repo = self.open(path)?;
        let branch = self.branch_name(&repo, branch)?;
        let refspec = if force {
            format!("+refs/heads/{branch}:refs/heads/{branch}")
        } else {
            format!("refs/heads/{branch}:refs/heads/{branch}")
        };

        let prompter = SuspendingPrompter::new(ProgressBar::hidden());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = git2::Config::open_default()?;
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(authenticator.credentials(&config));
        let mut options = git2::PushOptions::new();
        options.remote_callbacks(callbacks);

        let mut remote = repo.find_remote("origin")?;
        remote.push(&[refspec.as_str()], Some(&mut options))?;
        info!("pushed {branch} from {:?}", path.display());

        Ok(())
    }

    fn has_changes(&self, path: &Path) -> Result<bool> {
        let repo = self.open(path)?;
        let mut options = git2::StatusOptions::new();
        options.include_untracked(true);
        let statuses = repo.statuses(Some(&mut options))?;

        Ok(!statuses.is_empty())
    }

    #[instrument(skip(self, message), level = "debug")]
    fn commit(&self, path: &Path, message: &str, add_all: bool) -> Result<()> {
        let repo = self.open(path)?;
        let mut index = repo.index()?;
        if add_all {
            index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
            index.write()?;
        }

        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = repo.signature()?;
        let mut parents = Vec::new();
        if let Some(oid) = repo.head().ok().and_then(|head| head.target()) {
            parents.push(repo.find_commit(oid)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        info!("committed in {:?}: {message}", path.display());

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn switch_branch(&self, path: &Path, branch: &str, create: bool) -> Result<()> {
        let repo = self.open(path)?;
        if create {
            let head = repo.head()?.peel_to_commit()?;
            repo.branch(branch, &head, false)?;
        }

        let refname = format!("refs/heads/{branch}");
        repo.set_head(&refname)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().safe()))?;
        info!("switched {:?} to {branch}", path.display());

        Ok(())
    }
}

/// Credential prompter that suspends a progress bar for user input.
#[derive(Debug, Clone)]
struct SuspendingPrompter {
    bar: ProgressBar,
}

impl SuspendingPrompter {
    fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for SuspendingPrompter {
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar
            .suspend(|| Password::new("password").without_confirmation().prompt().ok())
    }

    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar
            .suspend(|| Password::new("passphrase").without_confirmation().prompt().ok())
    }
}

/// Aggregate outcome of one sync invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Repositories brought up to date.
    pub synced: usize,

    /// Repositories that failed.
    pub failed: usize,
}

/// Drive the tracked repository table.
pub struct RepoManager<V = Git2Vcs>
where
    V: Vcs + 'static,
{
    vcs: Arc<V>,
    settings: GitSettings,
    repositories: Vec<RepositoryEntry>,
}

impl<V> RepoManager<V>
where
    V: Vcs + 'static,
{
    /// Construct new repository manager.
    pub fn new(vcs: V, settings: GitSettings, repositories: Vec<RepositoryEntry>) -> Self {
        Self {
            vcs: Arc::new(vcs),
            settings,
            repositories,
        }
    }

    /// Synchronize every tracked repository concurrently.
    ///
    /// Each repository runs on its own blocking task: clone when missing,
    /// otherwise branch switch, optional auto-commit, pull, push.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Join`] if a sync task panics.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let tasks = self.repositories.iter().cloned().map(|entry| {
            let vcs = Arc::clone(&self.vcs);
            let template = self.settings.commit_message_template.clone();
            tokio::task::spawn_blocking(move || {
                let name = entry.name.clone();
                (name, sync_one(vcs.as_ref(), &entry, &template))
            })
        });

        let mut report = SyncReport::default();
        for result in join_all(tasks).await {
            let (name, outcome) = result?;
            match outcome {
                Ok(()) => report.synced += 1,
                Err(err) => {
                    warn!("repository {name:?} failed to sync: {err}");
                    report.failed += 1;
                }
            }
        }

        info!(
            "synchronized {}/{} repositories",
            report.synced,
            report.synced + report.failed
        );

        Ok(report)
    }
}

fn sync_one<V: Vcs + ?Sized>(vcs: &V, entry: &RepositoryEntry, template: &str) -> Result<()> {
    let branch = entry.branch.as_deref();
    if !vcs.is_repo(&entry.path) {
        vcs.clone_repo(&entry.remote, &entry.path, branch)?;
        return Ok(());
    }

    if let Some(branch) = branch {
        vcs.switch_branch(&entry.path, branch, false)?;
    }

    if entry.auto_commit && vcs.has_changes(&entry.path)? {
        vcs.commit(&entry.path, &render_commit_message(template), true)?;
    }

    let outcome = vcs.pull(&entry.path, branch)?;
    vcs.push(&entry.path, branch, outcome == PullOutcome::KeptLocal)?;

    Ok(())
}

/// Render a commit message template.
///
/// Substitutes `{date}` with today's civil date and `{hostname}` with the
/// machine's host name.
pub fn render_commit_message(template: &str) -> String {
    let days = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| (elapsed.as_secs() / 86_400) as i64)
        .unwrap_or(0);
    let (year, month, day) = civil_from_days(days);
    let date = format!("{year:04}-{month:02}-{day:02}");
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into());

    template
        .replace("{date}", &date)
        .replace("{hostname}", &hostname)
}

// Civil calendar conversion from days since the Unix epoch. Exact over the
// proleptic Gregorian calendar, leap years included.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;

    (if month <= 2 { year + 1 } else { year }, month, day)
}

/// Repository coordination error types.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Repository HEAD is detached, so no branch can be inferred.
    #[error("repository HEAD is detached, name a branch explicitly")]
    DetachedHead,

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Sync task panics.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = RepoError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn init_repo(path: &Path) -> anyhow::Result<Repository> {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(repo)
    }

    #[test]
    fn civil_conversion_handles_epoch_and_leap_years() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(10_957), (2000, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
        assert_eq!(civil_from_days(19_783), (2024, 3, 1));
    }

    #[test]
    fn commit_message_template_substitution() {
        let message = render_commit_message("sync {date} via {hostname}");
        assert!(message.starts_with("sync "));
        assert!(!message.contains("{date}"));
        assert!(!message.contains("{hostname}"));
    }

    #[test]
    fn is_repo_detects_repositories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo_dir = temp.path().join("repo");
        let plain_dir = temp.path().join("plain");
        std::fs::create_dir_all(&plain_dir)?;
        init_repo(&repo_dir)?;

        let vcs = Git2Vcs::new(GitConflictPolicy::Local);
        assert!(vcs.is_repo(&repo_dir));
        assert!(!vcs.is_repo(&plain_dir));

        Ok(())
    }

    #[test]
    fn commit_clears_pending_changes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo_dir = temp.path().join("repo");
        init_repo(&repo_dir)?;
        std::fs::write(repo_dir.join(".vimrc"), "set nocompatible")?;

        let vcs = Git2Vcs::new(GitConflictPolicy::Local);
        assert!(vcs.has_changes(&repo_dir)?);

        vcs.commit(&repo_dir, "add vimrc", true)?;
        assert!(!vcs.has_changes(&repo_dir)?);

        Ok(())
    }

    #[test]
    fn switch_branch_creates_from_head() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo_dir = temp.path().join("repo");
        let repo = init_repo(&repo_dir)?;
        std::fs::write(repo_dir.join("file"), "contents")?;

        let vcs = Git2Vcs::new(GitConflictPolicy::Local);
        vcs.commit(&repo_dir, "initial", true)?;
        vcs.switch_branch(&repo_dir, "feature", true)?;

        assert_eq!(repo.head()?.shorthand(), Some("feature"));

        Ok(())
    }

    #[test]
    fn clone_from_local_remote() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let upstream = temp.path().join("upstream");
        init_repo(&upstream)?;
        std::fs::write(upstream.join("file"), "contents")?;

        let vcs = Git2Vcs::new(GitConflictPolicy::Local);
        vcs.commit(&upstream, "initial", true)?;

        let checkout = temp.path().join("checkout");
        vcs.clone_repo(upstream.to_string_lossy().as_ref(), &checkout, None)?;

        assert!(vcs.is_repo(&checkout));
        assert_eq!(std::fs::read_to_string(checkout.join("file"))?, "contents");

        Ok(())
    }

    #[test]
    fn pull_fast_forwards_behind_checkout() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let upstream = temp.path().join("upstream");
        init_repo(&upstream)?;
        std::fs::write(upstream.join("file"), "v1")?;

        let vcs = Git2Vcs::new(GitConflictPolicy::Local);
        vcs.commit(&upstream, "initial", true)?;

        let checkout = temp.path().join("checkout");
        vcs.clone_repo(upstream.to_string_lossy().as_ref(), &checkout, None)?;

        // Upstream moves ahead.
        std::fs::write(upstream.join("file"), "v2")?;
        vcs.commit(&upstream, "update", true)?;

        let outcome = vcs.pull(&checkout, Some("main"))?;
        assert_eq!(outcome, PullOutcome::FastForward);
        assert_eq!(std::fs::read_to_string(checkout.join("file"))?, "v2");

        let outcome = vcs.pull(&checkout, Some("main"))?;
        assert_eq!(outcome, PullOutcome::UpToDate);

        Ok(())
    }
}
