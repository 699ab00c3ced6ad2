// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the instance runner.

use crate::{config::ExecutionMode, key::InstanceKey, pool::HealthState};
use camino::Utf8PathBuf;
use config::ConfigError;
use itertools::Itertools;
use semver::Version;
use smol_str::SmolStr;
use std::{collections::BTreeSet, error, fmt, io, sync::Arc, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing the harness config.
#[derive(Debug, Error)]
#[error("failed to parse harness config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// An error that occurred while parsing a settings fragment.
#[derive(Debug, Error)]
#[error("failed to parse instance settings")]
pub struct SettingsParseError {
    #[source]
    err: toml::de::Error,
}

impl SettingsParseError {
    pub(crate) fn new(err: toml::de::Error) -> Self {
        Self { err }
    }
}

/// An error reported by an instance locator, launcher or control surface.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct InstanceError {
    message: String,
    #[source]
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl InstanceError {
    /// Creates a new error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new error with the given message and underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// An error that occurred while looking for an installed instance.
#[derive(Debug, Error)]
pub enum LocateError {
    /// The locator could not enumerate installations.
    #[error("failed to enumerate installed instances")]
    Enumerate(#[source] InstanceError),

    /// No installation matches the requested version and capabilities.
    #[error(
        "no installed instance matches version {version} with capabilities [{}]",
        .capabilities.iter().join(", ")
    )]
    NoMatch {
        /// The requested version.
        version: Version,

        /// The requested capabilities.
        capabilities: BTreeSet<SmolStr>,
    },

    /// An installation matches, but it is not in a usable state.
    #[error(
        "instance at `{installation_path}` matches version {version}, \
         but is in an invalid state ({health:?})"
    )]
    Unhealthy {
        /// The requested version.
        version: Version,

        /// Where the matching installation lives.
        installation_path: Utf8PathBuf,

        /// The health of the matching installation.
        health: HealthState,
    },
}

/// An error that occurred while launching an instance.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No suitable installation was found.
    #[error(transparent)]
    Locate(#[from] LocateError),

    /// The process could not be started.
    #[error("failed to start instance at `{installation_path}`")]
    Spawn {
        /// The installation that was being started.
        installation_path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: InstanceError,
    },

    /// The instance did not become idle in time.
    #[error("instance did not become idle within {timeout:?}")]
    IdleTimeout {
        /// The timeout.
        timeout: Duration,
    },

    /// A call to the control surface failed.
    #[error("instance control failed while {operation}")]
    Control {
        /// What the runner was doing.
        operation: &'static str,

        /// The underlying error.
        #[source]
        error: InstanceError,
    },

    /// The instance exited before it was ready.
    #[error("instance exited during startup")]
    ExitedDuringStartup,
}

/// A lease was requested while another lease was still outstanding.
///
/// This always indicates a bug in the caller: every lease must be released (or dropped) before
/// the next one is acquired.
#[derive(Clone, Debug, Error)]
#[error(
    "contract violation: the lease for instance {outstanding} was not released \
     before acquiring an instance for {requested}"
)]
pub struct LeaseAlreadyOutstanding {
    requested: InstanceKey,
    outstanding: InstanceKey,
}

impl LeaseAlreadyOutstanding {
    pub(crate) fn new(requested: InstanceKey, outstanding: InstanceKey) -> Self {
        Self {
            requested,
            outstanding,
        }
    }

    /// Returns the key that was requested.
    pub fn requested(&self) -> &InstanceKey {
        &self.requested
    }

    /// Returns the key of the lease that was still outstanding.
    pub fn outstanding(&self) -> &InstanceKey {
        &self.outstanding
    }
}

/// An error returned by [`InstancePool::acquire`](crate::pool::InstancePool::acquire).
#[derive(Debug, Error)]
pub enum AcquireError {
    /// A lease is already outstanding.
    #[error(transparent)]
    ContractViolation(#[from] LeaseAlreadyOutstanding),

    /// The instance could not be launched.
    #[error("failed to launch instance for {key}")]
    Launch {
        /// The key being acquired.
        key: InstanceKey,

        /// The underlying error.
        #[source]
        error: LaunchError,
    },
}

/// An error that occurred on the affinity executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor thread could not be spawned.
    #[error("failed to spawn affinity thread")]
    Spawn(#[source] io::Error),

    /// The executor thread could not create its runtime.
    #[error("failed to create runtime on affinity thread")]
    RuntimeCreate(#[source] io::Error),

    /// The work panicked.
    #[error("work on affinity thread panicked: {message}")]
    Panicked {
        /// The panic message, if it was a string.
        message: String,
    },

    /// The executor shut down before the work completed.
    #[error("affinity thread exited before the work completed")]
    Disconnected,

    /// The executor thread did not exit in time.
    #[error("affinity thread did not exit within {timeout:?}")]
    JoinTimeout {
        /// The timeout.
        timeout: Duration,
    },
}

/// A failure not attributable to any one test.
///
/// When one of these occurs, every test that has not completed is reported as failed with a
/// [`HarnessFailure`] pointing at the fault.
#[derive(Debug, Error)]
pub enum InfrastructureFault {
    /// The instance could not be launched on the final attempt.
    #[error("failed to launch instance for {key}")]
    Launch {
        /// The key being launched.
        key: InstanceKey,

        /// The underlying error.
        #[source]
        error: LaunchError,
    },

    /// The test host failed while running a batch.
    #[error("test host failed while running a batch for {key}")]
    Host {
        /// The key of the batch.
        key: InstanceKey,

        /// The underlying error.
        #[source]
        error: InstanceError,
    },

    /// A batch did not finish within the hang timeout.
    #[error("batch for {key} did not finish within {timeout:?}")]
    HangTimeout {
        /// The key of the batch.
        key: InstanceKey,

        /// The timeout.
        timeout: Duration,
    },

    /// The affinity executor failed.
    #[error("affinity executor failed while running a batch for {key}")]
    Executor {
        /// The key of the batch.
        key: InstanceKey,

        /// The underlying error.
        #[source]
        error: ExecutorError,
    },

    /// The local runner panicked.
    #[error("local test runner panicked: {message}")]
    LocalRunnerPanicked {
        /// The panic message, if it was a string.
        message: String,
    },

    /// The configured execution mode is not implemented.
    #[error("execution mode `{mode}` is not implemented")]
    UnsupportedExecutionMode {
        /// The configured mode.
        mode: ExecutionMode,
    },
}

/// The cause attached to a test that did not run because of an [`InfrastructureFault`].
#[derive(Clone, Debug, Error)]
#[error("test did not run due to a harness failure")]
pub struct HarnessFailure {
    #[source]
    fault: Arc<InfrastructureFault>,
}

impl HarnessFailure {
    pub(crate) fn new(fault: Arc<InfrastructureFault>) -> Self {
        Self { fault }
    }

    /// Returns the fault that caused this failure.
    pub fn fault(&self) -> &Arc<InfrastructureFault> {
        &self.fault
    }
}

/// An error returned while running tests.
#[derive(Debug, Error)]
pub enum RunError<E> {
    /// A lease was not released. The run was aborted.
    #[error(transparent)]
    ContractViolation(#[from] LeaseAlreadyOutstanding),

    /// The event callback returned an error. The run was aborted.
    #[error("test event callback failed")]
    Callback(#[source] E),
}

/// An error that occurred while building a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),
}

/// Displays an error along with its chain of causes, one per line.
pub struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut current = self.0.source();
        while let Some(cause) = current {
            write!(f, "\n  caused by: {cause}")?;
            current = cause.source();
        }

        Ok(())
    }
}
