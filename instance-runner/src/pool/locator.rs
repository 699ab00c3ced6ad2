// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{InstanceError, LocateError},
    key::InstanceKey,
};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use smol_str::SmolStr;
use std::collections::BTreeSet;
use tracing::debug;

bitflags! {
    /// The health of an installation, as reported by an [`InstanceLocator`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct HealthState: u32 {
        /// The installation is on the local machine.
        const LOCAL = 1;
        /// The installation is registered with the installer.
        const REGISTERED = 1 << 1;
        /// The installation completed without errors.
        const NO_ERRORS = 1 << 2;
        /// No reboot is pending for the installation.
        const NO_REBOOT_REQUIRED = 1 << 3;
    }
}

impl HealthState {
    /// The minimum health an installation needs for the pool to launch it.
    pub const MINIMUM: Self = Self::LOCAL.union(Self::REGISTERED);

    /// Returns true if this state meets [`Self::MINIMUM`].
    pub fn is_usable(self) -> bool {
        self.contains(Self::MINIMUM)
    }
}

/// An installed copy of the application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceCandidate {
    /// Where the installation lives.
    pub installation_path: Utf8PathBuf,

    /// The installed version.
    pub version: Version,

    /// Capabilities (packages or extensions) the installation provides.
    pub capabilities: BTreeSet<SmolStr>,

    /// The health of the installation.
    pub health: HealthState,
}

/// Enumerates installed copies of the application.
pub trait InstanceLocator: Send + Sync {
    /// Returns every installation on this machine, in preference order.
    fn candidates(&self) -> Result<Vec<InstanceCandidate>, InstanceError>;
}

/// Chooses the installation to launch for `key`.
///
/// If `preferred` names an installation with the same major version as the key, only that
/// installation is considered. Otherwise candidates must have the key's major version and be at
/// least as new as the key's version. Among those, the first with all required capabilities and
/// minimum health wins.
pub(crate) fn select_candidate(
    candidates: Vec<InstanceCandidate>,
    key: &InstanceKey,
    preferred: Option<&Utf8Path>,
) -> Result<InstanceCandidate, LocateError> {
    let preferred = preferred.map(normalize_path).filter(|preferred| {
        let compatible = candidates
            .iter()
            .find(|c| normalize_path(&c.installation_path) == *preferred)
            .is_some_and(|c| key.is_version_compatible(&c.version));
        if compatible {
            debug!(%preferred, "restricting candidates to preferred installation");
        }
        compatible
    });

    let mut unhealthy = None;
    for candidate in candidates {
        if !key.is_version_compatible(&candidate.version) || candidate.version < *key.version() {
            continue;
        }
        if let Some(preferred) = &preferred {
            if normalize_path(&candidate.installation_path) != *preferred {
                continue;
            }
        }
        if !candidate
            .capabilities
            .is_superset(key.required_capabilities())
        {
            continue;
        }

        if candidate.health.is_usable() {
            return Ok(candidate);
        }
        unhealthy.get_or_insert(candidate);
    }

    match unhealthy {
        Some(candidate) => Err(LocateError::Unhealthy {
            version: key.version().clone(),
            installation_path: candidate.installation_path,
            health: candidate.health,
        }),
        None => Err(LocateError::NoMatch {
            version: key.version().clone(),
            capabilities: key.required_capabilities().clone(),
        }),
    }
}

/// Trims trailing separators and folds case, so that paths from environment variables compare
/// equal to paths reported by the locator.
fn normalize_path(path: &Utf8Path) -> String {
    path.as_str()
        .trim_end_matches(['/', '\\'])
        .to_lowercase()
}
