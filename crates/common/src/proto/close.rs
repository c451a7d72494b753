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

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// WebSocket close code, as observed by the peer.
pub type CloseCode = u16;

/// The reserved code a peer reports when a connection dies without a
/// close frame. Never sent on the wire; RFC 6455 forbids carrying it in
/// a close frame.
pub const ABNORMAL_CLOSURE: CloseCode = 1006;

/// Why the server closed a connection. Clients key reconnect behavior on
/// the code: a `resumed_elsewhere` close must not trigger auto-resume.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DisconnectReason {
    /// Outbound buffer crossed the critical watermark; the client is
    /// considered unable to receive.
    BufferBacklog,
    /// No pong within tolerance.
    HeartbeatTimeout,
    /// A session resume bound the player to a newer connection.
    ResumedElsewhere,
    /// Orderly server shutdown.
    Shutdown,
    /// The player quit cleanly.
    Quit,
}

impl DisconnectReason {
    /// True when the connection is torn down without a close frame. A
    /// critically backlogged client cannot be assumed able to receive
    /// one, so the socket is aborted and the peer observes 1006.
    #[must_use]
    pub fn is_abrupt(&self) -> bool {
        matches!(self, Self::BufferBacklog)
    }

    /// The close code the peer observes: an application code in the
    /// 4000–4999 private range for clean closes, `ABNORMAL_CLOSURE` for
    /// abrupt ones.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::BufferBacklog => ABNORMAL_CLOSURE,
            Self::HeartbeatTimeout => 4002,
            Self::ResumedElsewhere => 4003,
            Self::Shutdown => 4004,
            Self::Quit => 4000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_clean_closes_use_the_private_range() {
        let reasons = [
            DisconnectReason::BufferBacklog,
            DisconnectReason::HeartbeatTimeout,
            DisconnectReason::ResumedElsewhere,
            DisconnectReason::Shutdown,
            DisconnectReason::Quit,
        ];
        let mut codes: Vec<_> = reasons.iter().map(|r| r.close_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
        for reason in reasons {
            if reason.is_abrupt() {
                assert_eq!(reason.close_code(), ABNORMAL_CLOSURE);
            } else {
                assert!((4000..5000).contains(&reason.close_code()));
            }
        }
    }

    #[test]
    fn backlogged_clients_observe_abnormal_closure() {
        assert!(DisconnectReason::BufferBacklog.is_abrupt());
        assert_eq!(DisconnectReason::BufferBacklog.close_code(), 1006);
        assert!(!DisconnectReason::HeartbeatTimeout.is_abrupt());
        assert!(!DisconnectReason::Quit.is_abrupt());
    }

    #[test]
    fn reason_strings() {
        assert_eq!(DisconnectReason::BufferBacklog.to_string(), "buffer_backlog");
        assert_eq!(
            DisconnectReason::HeartbeatTimeout.to_string(),
            "heartbeat_timeout"
        );
    }
}
