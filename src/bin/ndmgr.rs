// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ndmgr::{
    config::{Config, ConflictPolicy, FoldStrategy},
    deploy::{Deployer, SimpleUnlinker},
    linker::{ConsolePrompter, ForceMode, LinkerOptions},
    path,
    repo::{Git2Vcs, RepoManager},
    scanner::ModuleScanner,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fs, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  ndmgr [options] <command>\n  ndmgr [options] link|unlink|relink [module]...",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the global configuration file.
    #[arg(long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Emit verbose diagnostics.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    async fn run(self) -> Result<bool> {
        let config = load_config(self.config.as_deref())?;
        match self.command {
            Command::Deploy(opts) => run_deploy(opts, &config, self.verbose),
            Command::Link(opts) => run_link(opts, &config, self.verbose),
            Command::Unlink(opts) => run_unlink(opts, &config, self.verbose),
            Command::Relink(opts) => run_relink(opts, &config, self.verbose),
            Command::Modules(opts) => run_modules(opts, &config),
            Command::Sync(opts) => run_sync(opts, &config).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Deploy every module discovered under the source root.
    #[command(override_usage = "ndmgr deploy [options]")]
    Deploy(DeployOptions),

    /// Link the named modules only.
    #[command(override_usage = "ndmgr link [options] <module>...")]
    Link(SelectOptions),

    /// Unlink the named modules.
    #[command(override_usage = "ndmgr unlink [options] [module]...")]
    Unlink(SelectOptions),

    /// Unlink then link the named modules.
    #[command(override_usage = "ndmgr relink [options] <module>...")]
    Relink(SelectOptions),

    /// List discovered modules and conflict previews.
    #[command(override_usage = "ndmgr modules [options]")]
    Modules(DeployOptions),

    /// Synchronize tracked repositories.
    #[command(override_usage = "ndmgr sync [options]")]
    Sync(SyncOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployOptions {
    /// Source root to scan for modules. Defaults to the working directory.
    #[arg(short, long, value_name = "dir")]
    pub source: Option<PathBuf>,

    /// Target base to materialize modules into.
    #[arg(short, long, value_name = "dir")]
    pub target: Option<PathBuf>,

    /// Override the configured conflict policy.
    #[arg(long, value_enum, value_name = "policy")]
    pub conflicts: Option<ConflictsArg>,

    /// Override the configured tree folding strategy.
    #[arg(long, value_enum, value_name = "strategy")]
    pub fold: Option<FoldArg>,

    /// Remove conflicting entries without writing backups.
    #[arg(long)]
    pub no_backup: bool,

    /// Answer prompts without asking.
    #[arg(long, value_enum, value_name = "answer")]
    pub force: Option<ForceArg>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SelectOptions {
    /// Modules to operate on.
    #[arg(value_name = "module")]
    pub modules: Vec<String>,

    #[command(flatten)]
    pub common: DeployOptions,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncOptions {
    /// Only synchronize the named repositories.
    #[arg(value_name = "repository")]
    pub repositories: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ConflictsArg {
    Fail,
    Skip,
    Adopt,
    Replace,
}

impl From<ConflictsArg> for ConflictPolicy {
    fn from(arg: ConflictsArg) -> Self {
        match arg {
            ConflictsArg::Fail => ConflictPolicy::Fail,
            ConflictsArg::Skip => ConflictPolicy::Skip,
            ConflictsArg::Adopt => ConflictPolicy::Adopt,
            ConflictsArg::Replace => ConflictPolicy::Replace,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FoldArg {
    Directory,
    Aggressive,
}

impl From<FoldArg> for FoldStrategy {
    fn from(arg: FoldArg) -> Self {
        match arg {
            FoldArg::Directory => FoldStrategy::Directory,
            FoldArg::Aggressive => FoldStrategy::Aggressive,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ForceArg {
    Default,
    Yes,
    No,
}

impl From<ForceArg> for ForceMode {
    fn from(arg: ForceArg) -> Self {
        match arg {
            ForceArg::Default => ForceMode::Default,
            ForceArg::Yes => ForceMode::Yes,
            ForceArg::No => ForceMode::No,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match cli.run().await {
        Ok(true) => exit(0),
        Ok(false) => exit(1),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

fn load_config(override_path: Option<&std::path::Path>) -> Result<Config> {
    let path = match override_path {
        Some(path) => Some(path.to_path_buf()),
        None => dirs::config_dir().map(|dir| dir.join("ndmgr").join("config.toml")),
    };

    let Some(path) = path else {
        return Ok(Config::default());
    };

    if !path.is_file() {
        return Ok(Config::default());
    }

    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration at {:?}", path.display()))?;

    data.parse()
        .with_context(|| format!("invalid configuration at {:?}", path.display()))
}

fn linker_options(opts: &DeployOptions, config: &Config, verbose: bool) -> LinkerOptions {
    let mut options = LinkerOptions::from(&config.linking);
    options.verbose = verbose || config.settings.verbose;
    if let Some(policy) = opts.conflicts {
        options.conflict_resolution = policy.into();
    }
    if let Some(strategy) = opts.fold {
        options.tree_folding = strategy.into();
    }
    if opts.no_backup {
        options.backup_conflicts = false;
    }
    if let Some(force) = opts.force {
        options.force = force.into();
    }

    options
}

fn build_deployer(
    opts: &DeployOptions,
    config: &Config,
    verbose: bool,
) -> Result<Deployer<ConsolePrompter>> {
    let source = match &opts.source {
        Some(source) => source.clone(),
        None => env::current_dir().context("cannot determine working directory")?,
    };
    let target = match &opts.target {
        Some(target) => target.clone(),
        None => match &config.settings.default_target {
            Some(target) => target.clone(),
            None => path::home_dir()?,
        },
    };

    let scanner = ModuleScanner::new(
        &source,
        config.linking.scan_depth,
        config.linking.ignore_patterns.clone(),
    )?;
    let deployer = Deployer::new(
        scanner,
        &target,
        linker_options(opts, config, verbose),
        ConsolePrompter,
    )?;

    Ok(deployer)
}

fn run_deploy(opts: DeployOptions, config: &Config, verbose: bool) -> Result<bool> {
    let mut deployer = build_deployer(&opts, config, verbose)?;
    let report = deployer.deploy()?;

    Ok(!report.is_partial())
}

fn run_link(opts: SelectOptions, config: &Config, verbose: bool) -> Result<bool> {
    let mut deployer = build_deployer(&opts.common, config, verbose)?;
    let report = deployer.link_modules(&opts.modules)?;

    Ok(!report.is_partial())
}

fn run_unlink(opts: SelectOptions, config: &Config, verbose: bool) -> Result<bool> {
    // Without explicit directories, fall back to the single-module path
    // operation against the working directory.
    if opts.common.source.is_none() && opts.common.target.is_none() {
        let base = env::current_dir().context("cannot determine working directory")?;
        let unlinker = SimpleUnlinker::new(base);
        for name in &opts.modules {
            let removed = unlinker.unlink(name)?;
            info!("module {name:?}: removed {removed} links");
        }
        return Ok(true);
    }

    let mut deployer = build_deployer(&opts.common, config, verbose)?;
    let report = deployer.unlink_modules(&opts.modules)?;

    Ok(!report.is_partial())
}

fn run_relink(opts: SelectOptions, config: &Config, verbose: bool) -> Result<bool> {
    let mut deployer = build_deployer(&opts.common, config, verbose)?;
    let report = deployer.relink_modules(&opts.modules)?;

    Ok(!report.is_partial())
}

fn run_modules(opts: DeployOptions, config: &Config) -> Result<bool> {
    let deployer = build_deployer(&opts, config, false)?;
    let listing = deployer.status()?;
    if listing.is_empty() {
        warn!("no modules found under source root");
        return Ok(true);
    }

    let mut status = String::new();
    for (module, conflict) in listing {
        let disposition = if module.ignore {
            "[ ignored]"
        } else if conflict.is_some() {
            "[conflict]"
        } else {
            "[   ready]"
        };

        status.push_str(&format!(
            "{} {} : {}\n  path: {}\n  target: {}\n",
            disposition,
            module.name,
            module.description.as_deref().unwrap_or("no description"),
            module.path.display(),
            module.target_dir.as_deref().unwrap_or("default"),
        ));
        if let Some(conflict) = conflict {
            status.push_str(&format!("  conflict: {conflict}\n"));
        }
    }

    info!("all available modules:\n{status}");
    Ok(true)
}

async fn run_sync(opts: SyncOptions, config: &Config) -> Result<bool> {
    let mut repositories = config.repositories.clone().unwrap_or_default();
    if !opts.repositories.is_empty() {
        repositories.retain(|entry| opts.repositories.contains(&entry.name));
    }

    if repositories.is_empty() {
        warn!("no repositories configured to synchronize");
        return Ok(true);
    }

    let vcs = Git2Vcs::new(config.git.conflict_resolution);
    let manager = RepoManager::new(vcs, config.git.clone(), repositories);
    let report = manager.sync_all().await?;

    Ok(report.failed == 0)
}
