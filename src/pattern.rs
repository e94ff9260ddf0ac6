// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ignore pattern matching.
//!
//! Simple glob matching against file base names. A pattern is either a lone
//! `*`, an exact name, or a name with a single `*` at the start, end, or
//! middle. No character classes, no `?`, and never applied to full paths.

/// Match a file base name against a single ignore pattern.
pub fn matches(name: impl AsRef<str>, pattern: impl AsRef<str>) -> bool {
    let name = name.as_ref();
    let pattern = pattern.as_ref();

    if pattern == "*" {
        return true;
    }

    if pattern == name {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return name.starts_with(prefix);
        }
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.contains('*') {
            return name.ends_with(suffix);
        }
    }

    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if !suffix.contains('*') {
            return name.starts_with(prefix)
                && name.ends_with(suffix)
                && name.len() >= prefix.len() + suffix.len();
        }
    }

    false
}

/// Match a file base name against a listing of ignore patterns.
pub fn matches_any<I, S>(name: impl AsRef<str>, patterns: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let name = name.as_ref();
    patterns
        .into_iter()
        .any(|pattern| matches(name, pattern.as_ref()))
}
