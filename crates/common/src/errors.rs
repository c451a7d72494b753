// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The error taxonomy of the system. Subsystems define their own concrete
//! `thiserror` enums and map onto these kinds at reporting boundaries;
//! the kind, not the concrete type, decides recovery policy.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Kinds of failure, as observed at subsystem boundaries.
///
/// Recovery policy by kind:
/// - `ProtocolError`: drop the frame, warn once, keep the connection.
/// - `AuthError`: one line to the client, no introspection.
/// - `PermissionDenied` / `NotFound`: reported with context phrasing.
/// - `InvariantViolation`: fatal for the operation, logged with stack.
/// - `TimeoutError` / `MemoryError`: script or await exceeded its bound.
/// - `StorageUnavailable` / `StorageConflict`: persistence adapter; the
///   caller decides whether to retry.
/// - `BufferBacklog` / `HeartbeatTimeout`: connection terminated with a
///   machine-readable close code.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ProtocolError,
    AuthError,
    PermissionDenied,
    NotFound,
    InvariantViolation,
    TimeoutError,
    MemoryError,
    StorageUnavailable,
    StorageConflict,
    BufferBacklog,
    HeartbeatTimeout,
}

impl ErrorKind {
    /// Whether an operation failing with this kind should tear down the
    /// connection it happened on.
    #[must_use]
    pub fn is_terminal_for_connection(&self) -> bool {
        matches!(self, Self::BufferBacklog | Self::HeartbeatTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(ErrorKind::StorageUnavailable.to_string(), "storage_unavailable");
        assert_eq!(
            ErrorKind::from_str("heartbeat_timeout").unwrap(),
            ErrorKind::HeartbeatTimeout
        );
    }

    #[test]
    fn terminal_kinds() {
        assert!(ErrorKind::BufferBacklog.is_terminal_for_connection());
        assert!(!ErrorKind::ProtocolError.is_terminal_for_connection());
    }
}
