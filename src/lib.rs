// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Symlink-farm manager for dotfile configurations.
//!
//! ndmgr materializes __modules__, directories of dotfiles kept under a
//! source root, into a target directory tree by creating symbolic links.
//! Pre-existing user data survives through a configurable conflict policy
//! with a user-visible backup discipline, whole directory trees collapse
//! into single directory symlinks where safe, and a matching unlink undoes
//! exactly what link did and nothing else.
//!
//! # Modules
//!
//! A module is any directory under the source root carrying a `.ndmgr`
//! descriptor file. The descriptor can redirect the module to its own
//! target directory and can mark the module as ignored. See
//! [`scanner::ModuleScanner`] for discovery rules and [`linker::Linker`]
//! for linking semantics.
//!
//! # Repositories
//!
//! Modules are typically backed by git repositories so the same dotfiles
//! follow their user from machine to machine. Repository coordination lives
//! behind the [`repo::Vcs`] trait and never leaks into the linking engine.

pub mod config;
pub mod deploy;
pub mod linker;
pub mod path;
pub mod pattern;
pub mod repo;
pub mod scanner;

pub use config::Config;
pub use deploy::{DeployReport, Deployer, SimpleUnlinker};
pub use linker::{Linker, LinkerOptions, LinkingStats};
pub use scanner::{Module, ModuleScanner};
