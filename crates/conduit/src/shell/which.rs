//! PATH resolution
//!
//! Resolves a command name to absolute executable paths by scanning each
//! `PATH` entry in order. Every candidate is recorded with what happened to
//! it, so "command not found" can be diagnosed.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::process::spawn::is_executable;

/// What the search found at one candidate path.
#[derive(Debug)]
pub enum SearchEvent {
    /// Looking at the candidate failed.
    Encountered(io::Error),
    /// The `PATH` entry is relative and was skipped.
    PathIsNotAbsolute,
    /// The candidate exists but cannot be executed.
    CandidateIsNotExecutable,
    Found,
}

/// Ordered log of a search.
#[derive(Debug, Default)]
pub struct SearchResults {
    pub log: Vec<(PathBuf, SearchEvent)>,
}

impl SearchResults {
    /// Paths that were found, in `PATH` order.
    pub fn matches(&self) -> impl Iterator<Item = &Path> {
        self.log.iter().filter_map(|(path, event)| match event {
            SearchEvent::Found => Some(path.as_path()),
            _ => None,
        })
    }

    /// The first path found.
    pub fn first(&self) -> Option<&Path> {
        self.matches().next()
    }
}

/// Search `path_env` for executables named `name`.
///
/// A name containing a `/` is not searched for; it is checked as given,
/// relative to `working_directory`.
pub fn search_path(
    name: &OsStr,
    path_env: Option<&OsStr>,
    working_directory: &Path,
) -> SearchResults {
    let mut results = SearchResults::default();

    if name.as_encoded_bytes().contains(&b'/') {
        let candidate = working_directory.join(name);
        let event = check(&candidate);
        results.log.push((candidate, event));
        return results;
    }

    let Some(path_env) = path_env else {
        return results;
    };
    for directory in std::env::split_paths(path_env) {
        if !directory.is_absolute() {
            results.log.push((directory, SearchEvent::PathIsNotAbsolute));
            continue;
        }
        let candidate = directory.join(name);
        let event = check(&candidate);
        results.log.push((candidate, event));
    }
    debug!(name = %name.to_string_lossy(), found = %results.matches().count(), "which.search");
    results
}

fn check(candidate: &Path) -> SearchEvent {
    match candidate.metadata() {
        Err(error) => SearchEvent::Encountered(error),
        Ok(_) if is_executable(candidate) => SearchEvent::Found,
        Ok(_) => SearchEvent::CandidateIsNotExecutable,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_finds_sh() {
        let results = search_path(OsStr::new("sh"), Some(OsStr::new("/usr/bin:/bin")), Path::new("/"));
        assert!(results.first().is_some());
    }

    #[test]
    fn test_not_found_logs_each_candidate() {
        let results = search_path(
            OsStr::new("nonexistent_command_12345"),
            Some(OsStr::new("/bin:relative/dir")),
            Path::new("/"),
        );
        assert!(results.first().is_none());
        assert!(matches!(results.log[0].1, SearchEvent::Encountered(_)));
        assert!(matches!(results.log[1].1, SearchEvent::PathIsNotAbsolute));
    }

    #[test]
    fn test_non_executable_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tool");
        std::fs::write(&file, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

        let results = search_path(OsStr::new("tool"), Some(dir.path().as_os_str()), Path::new("/"));
        assert!(matches!(
            results.log[0].1,
            SearchEvent::CandidateIsNotExecutable
        ));

        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();
        let results = search_path(OsStr::new("tool"), Some(dir.path().as_os_str()), Path::new("/"));
        assert_eq!(results.first(), Some(file.as_path()));
    }

    #[test]
    fn test_path_with_slash_is_not_searched() {
        let results = search_path(OsStr::new("/bin/sh"), None, Path::new("/tmp"));
        assert_eq!(results.log.len(), 1);
        assert_eq!(results.log[0].0, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_relative_name_resolves_against_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tool");
        std::fs::write(&file, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();

        let results = search_path(OsStr::new("./tool"), None, dir.path());
        assert_eq!(results.first(), Some(dir.path().join("./tool").as_path()));

        let elsewhere = search_path(OsStr::new("./tool"), None, Path::new("/"));
        assert!(elsewhere.first().is_none());
    }

    #[test]
    fn test_missing_path_variable() {
        assert!(search_path(OsStr::new("sh"), None, Path::new("/")).log.is_empty());
    }
}
