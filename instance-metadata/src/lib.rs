// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Messages exchanged between the instance runner and an out-of-process test host.
//!
//! The runner sends a batch of [`RemoteTestCase`]s to the host and receives a stream of
//! [`RemoteMessage`]s back. Everything in this crate is plain data: the host may live in a
//! different process, so test cases come back as copies, and the runner is responsible for
//! mapping them to its own objects.
//!
//! Messages are encoded as JSON, one message per line.

mod errors;
mod message;
mod test_case;

pub use errors::*;
pub use message::*;
pub use test_case::*;
