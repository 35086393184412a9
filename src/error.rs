// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error types surfaced by every public operation in the crate.

use thiserror::Error;

use crate::hci::StatusCode;

/// Results returned from operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for GAP operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An HCI command returned a non-success status code. The status is
    /// propagated to the caller verbatim.
    #[error("protocol error: {0}")]
    Protocol(StatusCode),

    /// No response arrived within the per-operation budget.
    #[error("operation timed out")]
    Timeout,

    /// The caller withdrew the request, or the owning manager is being
    /// torn down.
    #[error("operation canceled")]
    Canceled,

    /// The peer id has no cache entry.
    #[error("peer not found")]
    NotFound,

    /// The operation is illegal for the peer's technology.
    #[error("operation not supported for this peer")]
    NotSupported,

    /// L2CAP signaled a fatal channel failure.
    #[error("L2CAP link error")]
    LinkError,

    /// A pairing round returned failure, or Simple Pairing Complete
    /// reported an error.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Pairing succeeded but did not reach the requested security level,
    /// and no further attempts are warranted.
    #[error("pairing did not reach the requested security level")]
    InsufficientSecurity,

    /// An event or PDU payload failed parsing.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// An internal invariant failed. Reported rather than panicking so
    /// event-driven paths stay total.
    #[error("internal error: {0}")]
    Failed(&'static str),
}

impl Error {
    /// Builds an error from an HCI status byte, mapping the success code
    /// to `None`.
    pub fn from_status(status: StatusCode) -> Option<Error> {
        if status == StatusCode::Success {
            None
        } else {
            Some(Error::Protocol(status))
        }
    }

    /// Converts an HCI status byte into a `Result`.
    pub fn check_status(status: StatusCode) -> Result<()> {
        match Error::from_status(status) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_is_ok() {
        assert_eq!(Error::check_status(StatusCode::Success), Ok(()));
        assert!(Error::from_status(StatusCode::Success).is_none());
    }

    #[test]
    fn failure_status_maps_to_protocol_error() {
        assert_eq!(
            Error::check_status(StatusCode::PageTimeout),
            Err(Error::Protocol(StatusCode::PageTimeout))
        );
    }
}
