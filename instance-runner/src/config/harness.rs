// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ConfigParseError;
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{env, fmt, time::Duration};

/// Configuration for the harness itself, as opposed to the settings of individual tests.
///
/// Loaded from TOML, layered over [`HarnessConfig::DEFAULT_CONFIG`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct HarnessConfig {
    #[serde(with = "humantime_serde")]
    attempt_timeout: Duration,
    #[serde(with = "humantime_serde")]
    hang_timeout: Duration,
    #[serde(with = "humantime_serde")]
    idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    quit_timeout: Duration,
    default_root_suffix: String,
    no_exp_env: String,
    start_service_command: String,
    stop_service_command: String,
    execution_mode: ExecutionMode,
    #[serde(default)]
    preferred_install: Vec<PreferredInstallSource>,
}

impl HarnessConfig {
    /// The default configuration, embedded in the binary.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Loads the default configuration, optionally overridden by the file at `config_file`.
    pub fn from_sources(config_file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        let mut builder = Self::make_default_config();
        let source_name = match config_file {
            Some(config_file) => {
                builder = builder.add_source(File::new(config_file.as_str(), FileFormat::Toml));
                config_file.to_owned()
            }
            None => Utf8PathBuf::from("<default config>"),
        };
        Self::build(builder, source_name)
    }

    /// Loads the default configuration, overridden by the given TOML text.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigParseError> {
        let builder = Self::make_default_config().add_source(File::from_str(toml, FileFormat::Toml));
        Self::build(builder, "<inline config>")
    }

    /// How long a single batch attempt may run before it is considered hung.
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// How long to wait for the affinity thread to exit once its work is done.
    pub fn hang_timeout(&self) -> Duration {
        self.hang_timeout
    }

    /// How long a launched instance may take to become idle.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// How long to wait for an instance to exit after asking it to quit.
    pub fn quit_timeout(&self) -> Duration {
        self.quit_timeout
    }

    /// The command that starts the test service inside an instance.
    pub fn start_service_command(&self) -> &str {
        &self.start_service_command
    }

    /// The command that stops the test service inside an instance.
    pub fn stop_service_command(&self) -> &str {
        &self.stop_service_command
    }

    /// The execution mode.
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Sets the attempt timeout.
    pub fn set_attempt_timeout(&mut self, attempt_timeout: Duration) -> &mut Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Sets the hang timeout.
    pub fn set_hang_timeout(&mut self, hang_timeout: Duration) -> &mut Self {
        self.hang_timeout = hang_timeout;
        self
    }

    /// Sets the idle timeout.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) -> &mut Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// The root suffix to use when no settings fragment declares one.
    ///
    /// This is empty if the no-exp environment variable is set to a non-empty value.
    pub fn default_root_suffix(&self) -> &str {
        self.default_root_suffix_with(|name| env::var(name).ok())
    }

    pub(crate) fn default_root_suffix_with(&self, var: impl Fn(&str) -> Option<String>) -> &str {
        match var(&self.no_exp_env) {
            Some(value) if !value.is_empty() => "",
            _ => &self.default_root_suffix,
        }
    }

    /// The preferred installation path, taken from the first configured environment variable
    /// that is set to a non-empty value.
    pub fn preferred_install_path(&self) -> Option<Utf8PathBuf> {
        self.preferred_install_path_with(|name| env::var(name).ok())
    }

    pub(crate) fn preferred_install_path_with(
        &self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Option<Utf8PathBuf> {
        self.preferred_install.iter().find_map(|source| {
            let value = var(&source.env).filter(|value| !value.is_empty())?;
            let mut path = Utf8PathBuf::from(value);
            for _ in 0..source.ancestors {
                path = path.parent()?.to_owned();
            }
            Some(path)
        })
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build(
        builder: ConfigBuilder<DefaultState>,
        source_name: impl Into<Utf8PathBuf>,
    ) -> Result<Self, ConfigParseError> {
        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(source_name, err))
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60 * 60),
            hang_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
            quit_timeout: Duration::from_secs(10),
            default_root_suffix: "Exp".to_owned(),
            no_exp_env: "NOEXP".to_owned(),
            start_service_command: "Test.IntegrationTestService.Start".to_owned(),
            stop_service_command: "Test.IntegrationTestService.Stop".to_owned(),
            execution_mode: ExecutionMode::Affinity,
            preferred_install: vec![
                PreferredInstallSource::new("__UNITTESTEXPLORER_VSINSTALLPATH__", 0),
                PreferredInstallSource::new("VSAPPIDDIR", 2),
                PreferredInstallSource::new("VSInstallDir", 0),
            ],
        }
    }
}

/// An environment variable that points at a preferred installation.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct PreferredInstallSource {
    env: String,
    #[serde(default)]
    ancestors: usize,
}

impl PreferredInstallSource {
    fn new(env: &str, ancestors: usize) -> Self {
        Self {
            env: env.to_owned(),
            ancestors,
        }
    }
}

/// How batches are executed.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Each batch runs on a dedicated thread with its own run loop.
    #[default]
    Affinity,

    /// Tests run inside the instance process itself.
    ///
    /// Not implemented: selecting this mode fails the run with an infrastructure fault.
    InProcess,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Affinity => write!(f, "affinity"),
            Self::InProcess => write!(f, "in-process"),
        }
    }
}
