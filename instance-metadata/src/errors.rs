// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt};

/// An error that occurs while encoding or decoding a [`RemoteMessage`](crate::RemoteMessage).
#[derive(Debug)]
pub enum MessageError {
    /// The line could not be parsed as a message.
    Decode {
        /// The line that failed to parse.
        line: String,

        /// The underlying JSON error.
        error: serde_json::Error,
    },

    /// The message could not be serialized.
    Encode(serde_json::Error),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Decode { line, .. } => {
                write!(f, "failed to decode message from test host: `{line}`")
            }
            Self::Encode(_) => {
                write!(f, "failed to encode message for test host")
            }
        }
    }
}

impl error::Error for MessageError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Decode { error, .. } => Some(error),
            Self::Encode(error) => Some(error),
        }
    }
}
