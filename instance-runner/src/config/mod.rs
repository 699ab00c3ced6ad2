// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the instance runner.
//!
//! There are two layers of configuration:
//!
//! * [`HarnessConfig`] controls the harness itself: timeouts, service commands and where to look
//!   for a preferred installation. It is read from TOML with defaults embedded in the binary.
//! * [`SettingsFragment`]s are declared per test scope and resolve to the [`InstanceKey`] a test
//!   runs against.
//!
//! [`InstanceKey`]: crate::key::InstanceKey

mod harness;
mod settings;

pub use harness::*;
pub use settings::*;
