// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Runs tests against an instance of a heavyweight host application.
//!
//! Starting the application is expensive, so tests are grouped by the [`InstanceKey`] they need
//! and each group runs as one batch inside a single instance. The instance is kept running
//! between batches when the next batch can use it.
//!
//! The basic flow is:
//!
//! 1. Build an [`InstancePool`] from an [`InstanceLocator`] and an [`InstanceLauncher`].
//! 2. Build a [`TestRunner`] with a [`TestRunnerBuilder`].
//! 3. Call [`TestRunner::execute`] with the tests to run and a callback for [`TestEvent`]s.
//!
//! [`InstanceKey`]: key::InstanceKey
//! [`InstancePool`]: pool::InstancePool
//! [`InstanceLocator`]: pool::InstanceLocator
//! [`InstanceLauncher`]: pool::InstanceLauncher
//! [`TestRunner`]: runner::TestRunner
//! [`TestRunnerBuilder`]: runner::TestRunnerBuilder
//! [`TestRunner::execute`]: runner::TestRunner::execute
//! [`TestEvent`]: reporter::TestEvent

pub mod config;
pub mod errors;
pub mod key;
pub mod pool;
pub mod reporter;
pub mod runner;
pub mod test_case;
mod time;
