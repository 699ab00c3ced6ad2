// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// A test case as seen on the far side of the process boundary.
///
/// This is a copy of the runner's test case. The runner maps it back to its own object by
/// [`unique_id`](Self::unique_id).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteTestCase {
    /// The stable identifier of this test case.
    pub unique_id: SmolStr,

    /// The name shown to users.
    pub display_name: String,

    /// The kind of test case.
    pub kind: RemoteTestKind,

    /// The instance configuration this test case requires, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<RemoteInstanceKey>,
}

impl RemoteTestCase {
    /// Creates a new remote test case with no instance requirement.
    pub fn new(
        unique_id: impl Into<SmolStr>,
        display_name: impl Into<String>,
        kind: RemoteTestKind,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            display_name: display_name.into(),
            kind,
            instance: None,
        }
    }

    /// Sets the instance configuration required by this test case.
    pub fn with_instance(mut self, instance: RemoteInstanceKey) -> Self {
        self.instance = Some(instance);
        self
    }
}

/// The kind of a [`RemoteTestCase`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTestKind {
    /// A single test run against an instance.
    Fact,

    /// A data-driven test run against an instance.
    Theory,

    /// A smoke test that only checks that the instance starts.
    Instance,

    /// A test case of a kind the runner does not know how to reconstruct.
    #[serde(other)]
    Unknown,
}

impl RemoteTestKind {
    /// Returns true if the runner can rebuild a test case of this kind from its serialized form.
    pub fn is_recognized(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Returns the string form of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Theory => "theory",
            Self::Instance => "instance",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RemoteTestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The serialized form of an instance configuration.
///
/// Versions are carried as strings so that this crate does not constrain how the runner models
/// them.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteInstanceKey {
    /// The instance version, for example `17.0.0`.
    pub version: String,

    /// The root suffix (registry hive) the instance runs under. May be empty.
    #[serde(default)]
    pub root_suffix: String,

    /// The maximum number of attempts for tests using this instance.
    pub max_attempts: usize,

    /// Environment variables, as `KEY=VALUE` entries.
    #[serde(default)]
    pub environment_variables: Vec<String>,

    /// Capabilities (extensions or packages) the instance must provide.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}
