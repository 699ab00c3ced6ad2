// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locating, launching and leasing application instances.
//!
//! At most one instance is alive at a time. The [`InstancePool`] keeps it running between batches
//! when the next batch can use it, and hands out one [`Lease`] at a time.

mod imp;
mod launcher;
mod locator;

pub use imp::*;
pub use launcher::*;
pub use locator::*;
