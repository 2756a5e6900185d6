//! Process environment
//!
//! An ordered list of `NAME=VALUE` entries. Setting an existing name
//! replaces its value in place; unsetting removes it.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use super::which::{search_path, SearchResults};

/// Environment passed to spawned processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: Vec<(OsString, OsString)>,
}

impl Environment {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of this process's environment.
    pub fn process() -> Self {
        Self::from_pairs(std::env::vars_os())
    }

    /// Build from name/value pairs; a later duplicate replaces an earlier one.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut environment = Self::new();
        for (name, value) in pairs {
            environment.set(name, Some(value));
        }
        environment
    }

    /// Parse `NAME=VALUE` strings. Entries without `=` are skipped.
    pub fn from_strings(strings: impl IntoIterator<Item = OsString>) -> Self {
        Self::from_pairs(strings.into_iter().filter_map(|entry| {
            let bytes = entry.as_bytes();
            let split = bytes.iter().position(|b| *b == b'=')?;
            Some((
                OsString::from_vec(bytes[..split].to_vec()),
                OsString::from_vec(bytes[split + 1..].to_vec()),
            ))
        }))
    }

    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&OsStr> {
        let name = name.as_ref();
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_os_str())
    }

    /// Set `name` to `value`, or remove it when `value` is `None`.
    pub fn set<K, V>(&mut self, name: K, value: Option<V>)
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let name = name.into();
        match value {
            None => self.entries.retain(|(key, _)| *key != name),
            Some(value) => {
                let value = value.into();
                match self.entries.iter_mut().find(|(key, _)| *key == name) {
                    Some(entry) => entry.1 = value,
                    None => self.entries.push((name, value)),
                }
            }
        }
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_os_str(), value.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries as `NAME=VALUE` strings, for `envp`.
    pub fn strings(&self) -> Vec<OsString> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let mut entry = OsString::with_capacity(key.len() + value.len() + 1);
                entry.push(key);
                entry.push("=");
                entry.push(value);
                entry
            })
            .collect()
    }

    /// Look for executables named `name` along this environment's `PATH`.
    ///
    /// Names containing a `/` are checked relative to `working_directory`.
    pub fn search_for_executables(
        &self,
        name: impl AsRef<OsStr>,
        working_directory: &Path,
    ) -> SearchResults {
        search_path(name.as_ref(), self.get("PATH"), working_directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_replaces_in_place() {
        let mut env = Environment::from_pairs([("A", "1"), ("B", "2")]);
        env.set("A", Some("3"));
        assert_eq!(env.strings(), vec![OsString::from("A=3"), OsString::from("B=2")]);
    }

    #[test]
    fn test_unset_removes() {
        let mut env = Environment::from_pairs([("A", "1"), ("B", "2")]);
        env.set("A", None::<&str>);
        assert_eq!(env.get("A"), None);
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_duplicates_last_wins() {
        let env = Environment::from_pairs([("A", "1"), ("A", "2")]);
        assert_eq!(env.get("A"), Some(OsStr::new("2")));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_from_strings() {
        let env = Environment::from_strings(vec![
            OsString::from("PATH=/bin:/usr/bin"),
            OsString::from("EMPTY="),
            OsString::from("EQ=a=b"),
            OsString::from("junk"),
        ]);
        assert_eq!(env.get("PATH"), Some(OsStr::new("/bin:/usr/bin")));
        assert_eq!(env.get("EMPTY"), Some(OsStr::new("")));
        assert_eq!(env.get("EQ"), Some(OsStr::new("a=b")));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_process_snapshot_has_path() {
        let env = Environment::process();
        assert_eq!(env.get("PATH"), std::env::var_os("PATH").as_deref());
    }
}
