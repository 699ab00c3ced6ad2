// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    InstanceCandidate, InstanceControl, InstanceLauncher, InstanceLocator, InstanceProcess,
    LaunchRequest, LaunchedInstance, select_candidate,
};
use crate::{
    config::HarnessConfig,
    errors::{
        AcquireError, DisplayErrorChain, InstanceError, LaunchError, LeaseAlreadyOutstanding,
        LocateError,
    },
    key::InstanceKey,
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use semver::Version;
use smol_str::SmolStr;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Owns at most one running instance and hands out exclusive leases to it.
///
/// The pool is a cheap handle: clones share the same instance and lease state.
#[derive(Clone, Debug)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    locator: DebugIgnore<Arc<dyn InstanceLocator>>,
    launcher: DebugIgnore<Arc<dyn InstanceLauncher>>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

#[derive(Clone, Debug)]
struct PoolSettings {
    idle_timeout: Duration,
    quit_timeout: Duration,
    start_service_command: String,
    stop_service_command: String,
    preferred_install_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Default)]
struct PoolState {
    current: Option<ManagedInstance>,
    // The key of the outstanding lease, if any.
    outstanding: Option<InstanceKey>,
}

impl InstancePool {
    /// Creates a new, empty pool.
    ///
    /// The preferred installation path is read from the environment once, here.
    pub fn new(
        locator: Arc<dyn InstanceLocator>,
        launcher: Arc<dyn InstanceLauncher>,
        config: &HarnessConfig,
    ) -> Self {
        Self::with_preferred_install_path(
            locator,
            launcher,
            config,
            config.preferred_install_path(),
        )
    }

    /// Creates a new, empty pool with an explicit preferred installation path.
    pub fn with_preferred_install_path(
        locator: Arc<dyn InstanceLocator>,
        launcher: Arc<dyn InstanceLauncher>,
        config: &HarnessConfig,
        preferred_install_path: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                locator: DebugIgnore(locator),
                launcher: DebugIgnore(launcher),
                settings: PoolSettings {
                    idle_timeout: config.idle_timeout(),
                    quit_timeout: config.quit_timeout(),
                    start_service_command: config.start_service_command().to_owned(),
                    stop_service_command: config.stop_service_command().to_owned(),
                    preferred_install_path,
                },
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Acquires an exclusive lease on an instance compatible with `key`.
    ///
    /// The current instance is reused if it is running, has the key's major version and provides
    /// every required capability. Otherwise it is closed and a new instance is launched.
    ///
    /// Fails immediately with [`AcquireError::ContractViolation`] if a lease is outstanding.
    pub fn acquire(&self, key: &InstanceKey) -> Result<Lease, AcquireError> {
        let current = {
            let mut state = self.lock_state();
            if let Some(outstanding) = &state.outstanding {
                return Err(LeaseAlreadyOutstanding::new(key.clone(), outstanding.clone()).into());
            }
            state.outstanding = Some(key.clone());
            state.current.take()
        };

        // The launch happens without holding the lock. The outstanding key keeps other callers
        // out in the meantime.
        match self.prepare_instance(current, key) {
            Ok((instance, launched)) => Ok(Lease {
                pool: self.clone(),
                key: key.clone(),
                instance: Some(instance),
                launched,
            }),
            Err(error) => {
                self.lock_state().outstanding = None;
                Err(AcquireError::Launch {
                    key: key.clone(),
                    error,
                })
            }
        }
    }

    /// Releases a lease.
    ///
    /// If `can_reuse` is true and the instance is still running, it stays in the pool for the
    /// next [`acquire`](Self::acquire). Otherwise it is shut down.
    pub fn release(&self, mut lease: Lease, can_reuse: bool) {
        lease.finish(can_reuse);
    }

    /// Shuts down the pooled instance, if any.
    ///
    /// An outstanding lease is unaffected: its instance is shut down when it is released.
    pub fn shutdown(&self) {
        let current = self.lock_state().current.take();
        if let Some(mut instance) = current {
            info!(pid = instance.process_id(), "shutting down pooled instance");
            instance.close(true, &self.inner.settings);
        }
    }

    /// Returns true if a lease is outstanding.
    pub fn is_leased(&self) -> bool {
        self.lock_state().outstanding.is_some()
    }

    /// Returns the process ID of the pooled instance, if one is idle in the pool.
    pub fn idle_instance_id(&self) -> Option<u32> {
        self.lock_state()
            .current
            .as_ref()
            .map(ManagedInstance::process_id)
    }

    fn prepare_instance(
        &self,
        mut current: Option<ManagedInstance>,
        key: &InstanceKey,
    ) -> Result<(ManagedInstance, bool), LaunchError> {
        let settings = &self.inner.settings;

        // Checking liveness needs the instance mutably, which a match guard cannot borrow.
        let reusable = current
            .as_mut()
            .is_some_and(|instance| instance.can_serve(key));
        match current {
            Some(mut instance) if reusable => {
                debug!(pid = instance.process_id(), %key, "reusing running instance");
                // Keep the host process, but restart the service inside it.
                instance.close(false, settings);
                match instance.prepare(settings) {
                    Ok(()) => Ok((instance, false)),
                    Err(error) => {
                        instance.close(true, settings);
                        Err(error)
                    }
                }
            }
            Some(mut instance) => {
                info!(
                    pid = instance.process_id(),
                    version = %instance.version(),
                    %key,
                    "closing instance that cannot serve the requested key"
                );
                instance.close(true, settings);
                self.launch(key).map(|instance| (instance, true))
            }
            None => self.launch(key).map(|instance| (instance, true)),
        }
    }

    fn launch(&self, key: &InstanceKey) -> Result<ManagedInstance, LaunchError> {
        let settings = &self.inner.settings;

        let candidates = self
            .inner
            .locator
            .candidates()
            .map_err(LocateError::Enumerate)?;
        let candidate = select_candidate(
            candidates,
            key,
            settings.preferred_install_path.as_deref(),
        )?;

        let request = LaunchRequest::new(&candidate, key);
        info!(
            installation_path = %candidate.installation_path,
            version = %candidate.version,
            %key,
            "launching instance"
        );
        let launched = self
            .inner
            .launcher
            .launch(&request)
            .map_err(|error| LaunchError::Spawn {
                installation_path: candidate.installation_path.clone(),
                error,
            })?;

        let mut instance = ManagedInstance::new(launched, candidate);
        match instance.prepare(settings) {
            Ok(()) => Ok(instance),
            Err(error) => {
                instance.close(true, settings);
                Err(error)
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves the state consistent: every mutation is a single
        // assignment.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of the pooled instance for one batch attempt.
///
/// Return the lease with [`InstancePool::release`]. A lease that is dropped without being
/// released shuts its instance down. A lease that is never dropped keeps the pool busy, and the
/// next [`InstancePool::acquire`] fails with a contract violation.
#[derive(Debug)]
pub struct Lease {
    pool: InstancePool,
    key: InstanceKey,
    // Always Some until the lease is finished.
    instance: Option<ManagedInstance>,
    launched: bool,
}

impl Lease {
    /// Returns the key this lease was acquired for.
    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Returns true if the instance was launched for this lease rather than reused.
    pub fn was_launched(&self) -> bool {
        self.launched
    }

    /// Returns the leased instance.
    pub fn instance(&mut self) -> &mut ManagedInstance {
        self.instance
            .as_mut()
            .expect("instance is present until the lease is finished")
    }

    fn finish(&mut self, can_reuse: bool) {
        let Some(mut instance) = self.instance.take() else {
            return;
        };

        let keep = can_reuse && instance.is_running();
        if keep {
            debug!(pid = instance.process_id(), key = %self.key, "returning instance to pool");
        } else {
            debug!(
                pid = instance.process_id(),
                key = %self.key,
                can_reuse,
                "tearing down instance on release"
            );
            instance.close(true, &self.pool.inner.settings);
        }

        let mut state = self.pool.lock_state();
        state.outstanding = None;
        if keep {
            state.current = Some(instance);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.instance.is_some() {
            warn!(key = %self.key, "lease dropped without being released, tearing down instance");
            self.finish(false);
        }
    }
}

/// A running instance owned by the pool.
#[derive(Debug)]
pub struct ManagedInstance {
    process: DebugIgnore<Box<dyn InstanceProcess>>,
    control: DebugIgnore<Box<dyn InstanceControl>>,
    process_id: u32,
    version: Version,
    capabilities: BTreeSet<SmolStr>,
    installation_path: Utf8PathBuf,
}

impl ManagedInstance {
    fn new(launched: LaunchedInstance, candidate: InstanceCandidate) -> Self {
        let LaunchedInstance { process, control } = launched;
        let InstanceCandidate {
            installation_path,
            version,
            capabilities,
            health: _,
        } = candidate;
        Self {
            process_id: process.id(),
            process: DebugIgnore(process),
            control: DebugIgnore(control),
            version,
            capabilities,
            installation_path,
        }
    }

    /// Returns the process ID of the host process.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Returns the installed version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Returns the capabilities the installation provides.
    pub fn capabilities(&self) -> &BTreeSet<SmolStr> {
        &self.capabilities
    }

    /// Returns where the installation lives.
    pub fn installation_path(&self) -> &Utf8Path {
        &self.installation_path
    }

    /// Returns true if the host process is still running.
    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// Returns the control surface.
    pub fn control(&mut self) -> &mut dyn InstanceControl {
        &mut **self.control
    }

    fn can_serve(&mut self, key: &InstanceKey) -> bool {
        key.is_version_compatible(&self.version)
            && self.capabilities.is_superset(key.required_capabilities())
            && self.is_running()
    }

    // Idempotent: safe to run on a fresh instance and again on every reuse.
    fn prepare(&mut self, settings: &PoolSettings) -> Result<(), LaunchError> {
        if !self.is_running() {
            return Err(LaunchError::ExitedDuringStartup);
        }

        let start = settings.start_service_command.as_str();
        let available = self
            .control
            .is_command_available(start)
            .map_err(|error| control_error("checking for the start-service command", error))?;
        if available {
            self.control
                .execute_command(start)
                .map_err(|error| control_error("starting the test service", error))?;
        }

        let idle = self
            .control
            .wait_for_idle(settings.idle_timeout)
            .map_err(|error| control_error("waiting for the instance to become idle", error))?;
        if !idle {
            return Err(LaunchError::IdleTimeout {
                timeout: settings.idle_timeout,
            });
        }

        Ok(())
    }

    // Best effort: failures are logged, never returned.
    fn close(&mut self, exit_host: bool, settings: &PoolSettings) {
        if !self.is_running() {
            return;
        }

        let stop = settings.stop_service_command.as_str();
        match self.control.is_command_available(stop) {
            Ok(true) => {
                if let Err(error) = self.control.execute_command(stop) {
                    warn!(
                        pid = self.process_id,
                        error = %DisplayErrorChain::new(&error),
                        "failed to stop test service"
                    );
                }
            }
            Ok(false) => {}
            Err(error) => {
                warn!(
                    pid = self.process_id,
                    error = %DisplayErrorChain::new(&error),
                    "failed to check for the stop-service command"
                );
            }
        }

        if !exit_host {
            return;
        }

        if let Err(error) = self.control.quit() {
            warn!(
                pid = self.process_id,
                error = %DisplayErrorChain::new(&error),
                "failed to ask instance to quit"
            );
        }
        if !self.process.wait_for_exit(settings.quit_timeout) {
            warn!(
                pid = self.process_id,
                timeout = ?settings.quit_timeout,
                "instance did not exit in time, killing it"
            );
            if let Err(error) = self.process.kill() {
                warn!(
                    pid = self.process_id,
                    error = %DisplayErrorChain::new(&error),
                    "failed to kill instance"
                );
            }
        }
    }
}

fn control_error(operation: &'static str, error: InstanceError) -> LaunchError {
    LaunchError::Control { operation, error }
}
