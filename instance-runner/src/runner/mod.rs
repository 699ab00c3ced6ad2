// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`].

mod affinity;
mod bridge;
mod dispatcher;
mod imp;
mod local;
mod scheduler;
mod state;

use affinity::*;
pub use bridge::CurrentTestCase;
use bridge::*;
use dispatcher::*;
pub use imp::*;
pub use local::*;
use scheduler::*;
pub use state::*;
