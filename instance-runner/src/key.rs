// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifies the instance configuration a test requires.
//!
//! The main type in this module is [`InstanceKey`]. Tests with equal keys are grouped into the
//! same batch, and the pool reuses a live instance across keys when it is compatible.

use instance_metadata::RemoteInstanceKey;
use semver::Version;
use smol_str::SmolStr;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    process::Command,
};

/// The configuration of an application instance that a batch of tests runs against.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct InstanceKey {
    version: Version,
    root_suffix: SmolStr,
    max_attempts: NonZeroUsize,
    environment_variables: EnvironmentVariables,
    required_capabilities: BTreeSet<SmolStr>,
}

impl InstanceKey {
    /// Creates a new key for the given version, with no root suffix and a single attempt.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            root_suffix: SmolStr::default(),
            max_attempts: NonZeroUsize::MIN,
            environment_variables: EnvironmentVariables::default(),
            required_capabilities: BTreeSet::new(),
        }
    }

    /// Sets the root suffix.
    pub fn with_root_suffix(mut self, root_suffix: impl Into<SmolStr>) -> Self {
        self.root_suffix = root_suffix.into();
        self
    }

    /// Sets the maximum number of attempts for tests in this batch.
    pub fn with_max_attempts(mut self, max_attempts: NonZeroUsize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the environment variables passed to the instance.
    pub fn with_environment_variables(mut self, environment_variables: EnvironmentVariables) -> Self {
        self.environment_variables = environment_variables;
        self
    }

    /// Sets the capabilities the instance must provide.
    pub fn with_required_capabilities(
        mut self,
        capabilities: impl IntoIterator<Item = impl Into<SmolStr>>,
    ) -> Self {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the requested version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Returns the root suffix. Empty if the instance runs under the default root.
    pub fn root_suffix(&self) -> &str {
        &self.root_suffix
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> NonZeroUsize {
        self.max_attempts
    }

    /// Returns the environment variables.
    pub fn environment_variables(&self) -> &EnvironmentVariables {
        &self.environment_variables
    }

    /// Returns the required capabilities.
    pub fn required_capabilities(&self) -> &BTreeSet<SmolStr> {
        &self.required_capabilities
    }

    /// Returns true if an instance of version `other` can serve this key.
    pub fn is_version_compatible(&self, other: &Version) -> bool {
        self.version.major == other.major
    }

    pub(crate) fn to_remote(&self) -> RemoteInstanceKey {
        RemoteInstanceKey {
            version: self.version.to_string(),
            root_suffix: self.root_suffix.to_string(),
            max_attempts: self.max_attempts.get(),
            environment_variables: self.environment_variables.to_entries(),
            required_capabilities: self
                .required_capabilities
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }

    /// Rebuilds a key from its serialized form, returning `None` if it is malformed.
    pub(crate) fn from_remote(remote: &RemoteInstanceKey) -> Option<Self> {
        let version = parse_version(&remote.version)?;
        let max_attempts = NonZeroUsize::new(remote.max_attempts)?;
        Some(
            Self::new(version)
                .with_root_suffix(remote.root_suffix.as_str())
                .with_max_attempts(max_attempts)
                .with_environment_variables(EnvironmentVariables::from_entries(
                    &remote.environment_variables,
                ))
                .with_required_capabilities(remote.required_capabilities.iter().map(|c| c.as_str())),
        )
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.root_suffix.is_empty() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{} ({})", self.version, self.root_suffix)
        }
    }
}

/// Parses a version, accepting `major` and `major.minor` forms as well as full semver.
pub fn parse_version(input: &str) -> Option<Version> {
    let input = input.trim();
    if let Ok(version) = Version::parse(input) {
        return Some(version);
    }

    let mut parts = [0u64; 3];
    let mut count = 0;
    for part in input.split('.') {
        if count == parts.len() {
            return None;
        }
        parts[count] = part.parse().ok()?;
        count += 1;
    }
    let [major, minor, patch] = parts;
    Some(Version::new(major, minor, patch))
}

/// Environment variables passed to a launched instance.
///
/// Keys compare case-insensitively. A variable with an empty value is removed from the child
/// environment rather than set.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct EnvironmentVariables {
    vars: BTreeMap<EnvKey, String>,
}

impl EnvironmentVariables {
    /// Parses `KEY=VALUE` entries. An entry without `=` (or starting with `=`) is a key with an
    /// empty value. Later entries replace earlier ones with the same key.
    pub fn from_entries(entries: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut vars = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            match entry.find('=') {
                Some(index) if index > 0 => vars.insert(&entry[..index], &entry[index + 1..]),
                _ => vars.insert(entry, ""),
            }
        }
        vars
    }

    /// Sets a variable, replacing any existing variable whose key matches case-insensitively.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let key = EnvKey::new(key);
        // BTreeMap::insert keeps the old key, so remove it first to pick up the new spelling.
        self.vars.remove(&key);
        self.vars.insert(key, value.into());
    }

    /// Sets a variable only if no variable with a matching key exists.
    pub fn insert_if_absent(&mut self, key: &str, value: impl Into<String>) {
        self.vars
            .entry(EnvKey::new(key))
            .or_insert_with(|| value.into());
    }

    /// Returns the value for a key, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(&EnvKey::new(key)).map(String::as_str)
    }

    /// Returns the number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns true if there are no variables.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates over the variables as `(key, value)` pairs, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.vars
            .iter()
            .map(|(key, value)| (key.original.as_str(), value.as_str()))
    }

    /// Returns the changes to apply to a child process's environment.
    pub fn changes(&self) -> impl Iterator<Item = EnvChange<'_>> + '_ {
        self.iter().map(|(key, value)| {
            if value.is_empty() {
                EnvChange::Remove(key)
            } else {
                EnvChange::Set(key, value)
            }
        })
    }

    /// Applies these variables to a command.
    pub fn apply_to(&self, command: &mut Command) {
        for change in self.changes() {
            match change {
                EnvChange::Set(key, value) => {
                    command.env(key, value);
                }
                EnvChange::Remove(key) => {
                    command.env_remove(key);
                }
            }
        }
    }

    fn to_entries(&self) -> Vec<String> {
        self.iter().map(|(key, value)| format!("{key}={value}")).collect()
    }
}

/// A change to a child process's environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvChange<'a> {
    /// Set the variable to the value.
    Set(&'a str, &'a str),

    /// Remove the variable.
    Remove(&'a str),
}

/// An environment variable name that compares case-insensitively but remembers its spelling.
#[derive(Clone, Debug)]
struct EnvKey {
    folded: String,
    original: String,
}

impl EnvKey {
    fn new(key: &str) -> Self {
        Self {
            folded: key.to_lowercase(),
            original: key.to_owned(),
        }
    }
}

impl PartialEq for EnvKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for EnvKey {}

impl PartialOrd for EnvKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EnvKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded.cmp(&other.folded)
    }
}

impl Hash for EnvKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}
