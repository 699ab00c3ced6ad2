// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test cases known to the runner.

use crate::key::InstanceKey;
use instance_metadata::{RemoteTestCase, RemoteTestKind};
use smol_str::SmolStr;
use std::{borrow::Borrow, fmt};

/// The stable identifier of a test case.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TestCaseId(SmolStr);

impl TestCaseId {
    /// Creates a new identifier.
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TestCaseId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of a test case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TestCaseKind {
    /// Runs in the current process, without an instance.
    Local,

    /// A single test run against an instance.
    Fact,

    /// A data-driven test run against an instance.
    Theory,

    /// A smoke test that checks an instance can be started.
    ///
    /// If any other test ran against the same key in this run, the smoke test passes without
    /// running.
    Instance,

    /// A test case reported by the host that the runner could not reconstruct.
    Generic,
}

/// A test case to run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCase {
    id: TestCaseId,
    display_name: String,
    kind: TestCaseKind,
    required_key: Option<InstanceKey>,
}

impl TestCase {
    /// Creates a test case that runs locally.
    pub fn local(id: impl Into<SmolStr>, display_name: impl Into<String>) -> Self {
        Self {
            id: TestCaseId::new(id),
            display_name: display_name.into(),
            kind: TestCaseKind::Local,
            required_key: None,
        }
    }

    /// Creates a test case that runs against an instance with the given key.
    ///
    /// The ID is derived from `base_id`, the root suffix and the version, so that the same test
    /// declared for several versions gets a distinct ID per version.
    pub fn fact(base_id: &str, name: &str, key: InstanceKey) -> Self {
        Self::for_key(base_id, name, TestCaseKind::Fact, key)
    }

    /// Creates a data-driven test case that runs against an instance with the given key.
    pub fn theory(base_id: &str, name: &str, key: InstanceKey) -> Self {
        Self::for_key(base_id, name, TestCaseKind::Theory, key)
    }

    /// Creates the smoke test for the given key.
    pub fn smoke(base_id: &str, name: &str, key: InstanceKey) -> Self {
        Self::for_key(base_id, name, TestCaseKind::Instance, key)
    }

    fn for_key(base_id: &str, name: &str, kind: TestCaseKind, key: InstanceKey) -> Self {
        let version = key.version();
        let (id, display_name) = if key.root_suffix().is_empty() {
            (format!("{base_id}_{version}"), format!("{name} ({version})"))
        } else {
            let suffix = key.root_suffix();
            (
                format!("{base_id}_{suffix}_{version}"),
                format!("{name} ({version}, {suffix})"),
            )
        };

        Self {
            id: TestCaseId::new(id),
            display_name,
            kind,
            required_key: Some(key),
        }
    }

    /// Returns the ID.
    pub fn id(&self) -> &TestCaseId {
        &self.id
    }

    /// Returns the display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the kind.
    pub fn kind(&self) -> TestCaseKind {
        self.kind
    }

    /// Returns the key of the instance this test runs against, or `None` if it runs locally.
    pub fn required_key(&self) -> Option<&InstanceKey> {
        self.required_key.as_ref()
    }

    /// Converts this test case to the form sent to the host.
    pub fn to_remote(&self) -> RemoteTestCase {
        let kind = match self.kind {
            TestCaseKind::Fact => RemoteTestKind::Fact,
            TestCaseKind::Theory => RemoteTestKind::Theory,
            TestCaseKind::Instance => RemoteTestKind::Instance,
            TestCaseKind::Local | TestCaseKind::Generic => RemoteTestKind::Unknown,
        };
        let remote = RemoteTestCase::new(self.id.0.clone(), self.display_name.clone(), kind);
        match &self.required_key {
            Some(key) => remote.with_instance(key.to_remote()),
            None => remote,
        }
    }

    /// Builds a local test case from one reported by the host whose ID the runner does not
    /// know.
    ///
    /// Recognized kinds with a well-formed key are rebuilt as the same kind. Anything else
    /// becomes a [`TestCaseKind::Generic`] test case.
    pub(crate) fn from_remote(remote: &RemoteTestCase) -> Self {
        let kind = match remote.kind {
            RemoteTestKind::Fact => Some(TestCaseKind::Fact),
            RemoteTestKind::Theory => Some(TestCaseKind::Theory),
            RemoteTestKind::Instance => Some(TestCaseKind::Instance),
            RemoteTestKind::Unknown => None,
        };
        let key = remote.instance.as_ref().and_then(InstanceKey::from_remote);

        match (kind, key) {
            (Some(kind), Some(key)) => Self {
                id: TestCaseId::new(remote.unique_id.clone()),
                display_name: remote.display_name.clone(),
                kind,
                required_key: Some(key),
            },
            _ => Self {
                id: TestCaseId::new(remote.unique_id.clone()),
                display_name: remote.display_name.clone(),
                kind: TestCaseKind::Generic,
                required_key: None,
            },
        }
    }

    /// A placeholder for a test the host referred to only by ID.
    pub(crate) fn generic(id: impl Into<SmolStr>) -> Self {
        let id = TestCaseId::new(id);
        Self {
            display_name: id.as_str().to_owned(),
            id,
            kind: TestCaseKind::Generic,
            required_key: None,
        }
    }
}
