// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes carried on command responses.
///
/// The execution engine never returns an `Err` to its caller; every
/// failure path produces a response with `success: false`, a
/// human-readable `error` message, and one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    UnknownCommand,
    UnknownSession,
    Conflict,
    DependencyUnknown,
    DependencyFailed,
    DependencyTimeout,
    DependencySameLane,
    VersionConflict,
    InFlightLimit,
    CircuitOpen,
    Timeout,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::UnknownCommand => "unknown_command",
            Self::UnknownSession => "unknown_session",
            Self::Conflict => "conflict",
            Self::DependencyUnknown => "dependency_unknown",
            Self::DependencyFailed => "dependency_failed",
            Self::DependencyTimeout => "dependency_timeout",
            Self::DependencySameLane => "dependency_same_lane",
            Self::VersionConflict => "version_conflict",
            Self::InFlightLimit => "in_flight_limit",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
