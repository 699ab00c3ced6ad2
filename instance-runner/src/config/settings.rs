// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::SettingsParseError,
    key::{EnvironmentVariables, InstanceKey, parse_version},
};
use semver::Version;
use serde::Deserialize;
use smol_str::SmolStr;
use std::{collections::BTreeSet, fmt, num::NonZeroUsize};

/// Instance settings declared at a single scope, such as a test, its class or its assembly.
///
/// Every field is optional. Fragments are combined with [`SettingsFragment::resolve`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SettingsFragment {
    /// The lowest major version to run against.
    #[serde(default, deserialize_with = "deserialize_version")]
    pub min_version: Option<Version>,

    /// The highest major version to run against.
    #[serde(default, deserialize_with = "deserialize_version")]
    pub max_version: Option<Version>,

    /// The root suffix.
    #[serde(default)]
    pub root_suffix: Option<String>,

    /// The maximum number of attempts. Zero is treated as unset.
    #[serde(default)]
    pub max_attempts: Option<usize>,

    /// Environment variables, as `KEY=VALUE` entries.
    #[serde(default)]
    pub environment_variables: Vec<String>,

    /// Capabilities the instance must provide.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl SettingsFragment {
    /// Parses a fragment from TOML.
    pub fn from_toml_str(input: &str) -> Result<Self, SettingsParseError> {
        toml::from_str(input).map_err(SettingsParseError::new)
    }

    /// Combines fragments into resolved settings.
    ///
    /// `fragments` must be ordered closest scope first. For each scalar, the first fragment with
    /// a valid value wins. Environment variables and capabilities are unioned; for environment
    /// variables with the same key, the closest scope wins.
    pub fn resolve<'a>(
        fragments: impl IntoIterator<Item = &'a SettingsFragment>,
        default_root_suffix: &str,
    ) -> ResolvedSettings {
        let mut acc = SettingsAccumulator::default();
        for fragment in fragments {
            acc.accumulate(fragment);
        }
        acc.finish(default_root_suffix)
    }
}

#[derive(Debug, Default)]
struct SettingsAccumulator {
    min_version: Option<Version>,
    max_version: Option<Version>,
    root_suffix: Option<String>,
    max_attempts: Option<NonZeroUsize>,
    environment_variables: EnvironmentVariables,
    required_capabilities: BTreeSet<SmolStr>,
}

impl SettingsAccumulator {
    fn accumulate(&mut self, fragment: &SettingsFragment) {
        if self.min_version.is_none() {
            self.min_version = fragment.min_version.clone();
        }
        if self.max_version.is_none() {
            self.max_version = fragment.max_version.clone();
        }
        if self.root_suffix.is_none() {
            self.root_suffix = fragment.root_suffix.clone();
        }
        if self.max_attempts.is_none() {
            self.max_attempts = fragment.max_attempts.and_then(NonZeroUsize::new);
        }

        let vars = EnvironmentVariables::from_entries(&fragment.environment_variables);
        for (key, value) in vars.iter() {
            self.environment_variables.insert_if_absent(key, value);
        }

        self.required_capabilities
            .extend(fragment.required_capabilities.iter().map(SmolStr::new));
    }

    fn finish(self, default_root_suffix: &str) -> ResolvedSettings {
        ResolvedSettings {
            min_version: self
                .min_version
                .unwrap_or(ResolvedSettings::DEFAULT_MIN_VERSION),
            max_version: self
                .max_version
                .unwrap_or(ResolvedSettings::DEFAULT_MAX_VERSION),
            root_suffix: self
                .root_suffix
                .unwrap_or_else(|| default_root_suffix.to_owned()),
            max_attempts: self.max_attempts.unwrap_or(NonZeroUsize::MIN),
            environment_variables: self.environment_variables,
            required_capabilities: self.required_capabilities,
        }
    }
}

/// Settings for a test after all applicable fragments have been combined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSettings {
    min_version: Version,
    max_version: Version,
    root_suffix: String,
    max_attempts: NonZeroUsize,
    environment_variables: EnvironmentVariables,
    required_capabilities: BTreeSet<SmolStr>,
}

impl ResolvedSettings {
    /// The lowest major version used when no fragment declares one.
    pub const DEFAULT_MIN_VERSION: Version = Version::new(11, 0, 0);

    /// The highest major version used when no fragment declares one.
    pub const DEFAULT_MAX_VERSION: Version = Version::new(17, 0, 0);

    /// Returns the resolved root suffix.
    pub fn root_suffix(&self) -> &str {
        &self.root_suffix
    }

    /// Returns the resolved maximum number of attempts.
    pub fn max_attempts(&self) -> NonZeroUsize {
        self.max_attempts
    }

    /// Returns the resolved environment variables.
    pub fn environment_variables(&self) -> &EnvironmentVariables {
        &self.environment_variables
    }

    /// Returns true if `version` falls within the resolved range. Only major versions are
    /// compared.
    pub fn contains_version(&self, version: &Version) -> bool {
        (self.min_version.major..=self.max_version.major).contains(&version.major)
    }

    /// Returns one instance key per supported version within the resolved range, in the order
    /// the versions are given.
    pub fn instance_keys<'a>(
        &self,
        supported_versions: impl IntoIterator<Item = &'a Version>,
    ) -> Vec<InstanceKey> {
        let mut seen = BTreeSet::new();
        supported_versions
            .into_iter()
            .filter(|version| self.contains_version(version))
            .filter(|version| seen.insert((*version).clone()))
            .map(|version| {
                InstanceKey::new(version.clone())
                    .with_root_suffix(self.root_suffix.as_str())
                    .with_max_attempts(self.max_attempts)
                    .with_environment_variables(self.environment_variables.clone())
                    .with_required_capabilities(self.required_capabilities.iter().cloned())
            })
            .collect()
    }
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<Version>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;

    impl serde::de::Visitor<'_> for V {
        type Value = Option<Version>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a version string (\"17\", \"16.11\") or a major version (17)")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v.is_empty() {
                return Ok(None);
            }
            parse_version(v)
                .map(Some)
                .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            u64::try_from(v)
                .map(|major| Some(Version::new(major, 0, 0)))
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Signed(v), &self))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(Version::new(v, 0, 0)))
        }
    }

    deserializer.deserialize_any(V)
}
