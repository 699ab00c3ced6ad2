// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events produced by the runner, and consumers for them.
//!
//! The runner passes a stream of [`TestEvent`]s to a callback. [`RunSummary`] is the aggregate
//! returned at the end of a run, and [`JunitCollector`] turns the stream into a JUnit report.

mod aggregator;
mod events;
mod junit;

pub use aggregator::*;
pub use events::*;
pub use junit::*;
