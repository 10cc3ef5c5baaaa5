// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types for the transport and wire codec.

use std::io;
use thiserror::Error;

use super::protocol::Command;

/// Errors from encoding or decoding frames and replies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("empty payload")]
    Empty,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("too many messages for one frame: {0}")]
    TooManyMessages(usize),
    #[error("{} is not a request", .0.as_str())]
    NotARequest(Command),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Errors from one connect or exchange attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no bonded device named {0}")]
    UnknownPeer(String),
    #[error("connect to {peer} gave up after {attempts} attempts")]
    ConnectTimeout { peer: String, attempts: u32 },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// How an OS-level failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry after the normal delay.
    Retryable,
    /// Retrying cannot help (bad address, unsupported operation).
    Fatal,
    /// The OS refuses Bluetooth for this process until it is foregrounded.
    BackgroundRestricted,
}

/// Classify an I/O error from connect, listen or accept.
pub fn classify(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorClass::BackgroundRestricted,
        io::ErrorKind::InvalidInput
        | io::ErrorKind::Unsupported
        | io::ErrorKind::AddrNotAvailable => ErrorClass::Fatal,
        _ => ErrorClass::Retryable,
    }
}
