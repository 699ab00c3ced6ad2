// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::InstanceError,
    key::{EnvironmentVariables, InstanceKey},
    pool::InstanceCandidate,
};
use camino::Utf8PathBuf;
use instance_metadata::{BatchTotals, RemoteMessage, RemoteTestCase};
use semver::Version;
use smol_str::SmolStr;
use std::{collections::BTreeSet, process::Command, time::Duration};

/// Everything a launcher needs to start an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// The installation to start.
    pub installation_path: Utf8PathBuf,

    /// The installed version.
    pub version: Version,

    /// The root suffix to start under. Empty for the default root.
    pub root_suffix: SmolStr,

    /// Environment variables for the new process.
    pub environment_variables: EnvironmentVariables,

    /// Capabilities the instance must load.
    pub required_capabilities: BTreeSet<SmolStr>,
}

impl LaunchRequest {
    pub(crate) fn new(candidate: &InstanceCandidate, key: &InstanceKey) -> Self {
        Self {
            installation_path: candidate.installation_path.clone(),
            version: candidate.version.clone(),
            root_suffix: key.root_suffix().into(),
            environment_variables: key.environment_variables().clone(),
            required_capabilities: key.required_capabilities().clone(),
        }
    }

    /// Applies the environment of this request to `command`.
    ///
    /// Variables with empty values are removed from the child's environment.
    pub fn apply_env(&self, command: &mut Command) {
        self.environment_variables.apply_to(command);
    }
}

/// Starts instances.
pub trait InstanceLauncher: Send + Sync {
    /// Starts a new instance. This returns as soon as the process exists; the pool waits for it
    /// to become idle.
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedInstance, InstanceError>;
}

/// A freshly started instance.
pub struct LaunchedInstance {
    /// The host process.
    pub process: Box<dyn InstanceProcess>,

    /// The control surface of the instance.
    pub control: Box<dyn InstanceControl>,
}

/// The host process of an instance.
pub trait InstanceProcess: Send {
    /// The operating system's process ID.
    fn id(&self) -> u32;

    /// Returns true if the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Waits up to `timeout` for the process to exit. Returns true if it exited.
    fn wait_for_exit(&mut self, timeout: Duration) -> bool;

    /// Kills the process.
    fn kill(&mut self) -> Result<(), InstanceError>;
}

/// The control surface of a running instance.
///
/// Methods are called from an affinity thread, never from two threads at once.
pub trait InstanceControl: Send {
    /// Waits up to `timeout` for the instance to finish any startup work. Returns false if it is
    /// still busy when the timeout elapses.
    fn wait_for_idle(&mut self, timeout: Duration) -> Result<bool, InstanceError>;

    /// Runs `tests` inside the instance, reporting progress to `sink` as it goes.
    ///
    /// Returns the totals reported by the instance once the batch is done.
    fn run_batch(
        &mut self,
        tests: &[RemoteTestCase],
        sink: &mut dyn MessageSink,
    ) -> Result<BatchTotals, InstanceError>;

    /// Asks the instance to exit.
    fn quit(&mut self) -> Result<(), InstanceError>;

    /// Returns true if the named command exists and is enabled.
    fn is_command_available(&mut self, name: &str) -> Result<bool, InstanceError>;

    /// Executes the named command.
    fn execute_command(&mut self, name: &str) -> Result<(), InstanceError>;
}

/// Receives messages from an instance while it runs a batch.
pub trait MessageSink {
    /// Handles a message. Returns false once the receiver wants the host to stop starting new
    /// work; the host should still deliver messages for work already in progress.
    fn on_message(&mut self, message: RemoteMessage) -> bool;
}
