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

use bytes::Bytes;
use serde::Serialize;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

use crate::proto::payloads::{AuthRequest, IdeRequest, SessionResume};

/// Largest accepted frame payload, inbound or outbound. Matches the
/// WebSocket max-message configuration on the `/ws` endpoint.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// The closed set of registered frame types. Adding one is a coordinated
/// change with all clients; nothing outside this set goes on the wire as
/// a typed frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FrameType {
    Stats,
    Map,
    Combat,
    Equipment,
    Quest,
    Comm,
    Sound,
    Giphy,
    Ide,
    Gui,
    Session,
    Time,
    Gametime,
    Completion,
    Auth,
    Visibility,
}

impl FrameType {
    #[must_use]
    pub fn registered(name: &str) -> Option<FrameType> {
        FrameType::iter().find(|t| t.to_string() == name)
    }
}

/// A decoded inbound message from a client.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// A plain text line; treated as a command per the protocol contract.
    Text(String),
    /// `AUTH {name, password}` or `AUTH {session_token}`.
    Auth(AuthRequest),
    /// `SESSION {token}` resume request.
    Session(SessionResume),
    /// `COMMAND <raw text>`.
    Command(String),
    /// `IDE {action, path, content?}` while an editor handler is pushed.
    Ide(IdeRequest),
    /// Protocol-level pong (the `PONG` envelope; native WebSocket pongs
    /// are handled below the codec).
    Pong,
    Ping,
    Close,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame envelope")]
    MalformedEnvelope,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame type {0} is not accepted from clients")]
    UnexpectedInbound(FrameType),
    #[error("frame payload is not valid JSON: {0}")]
    BadPayload(#[from] serde_json::Error),
    #[error("frame payload exceeds {MAX_FRAME_PAYLOAD} bytes ({0})")]
    PayloadTooLarge(usize),
    #[error("frame payload is not valid UTF-8")]
    BadEncoding,
}

/// Encode raw narrative text. No framing; newline discipline is the
/// caller's (`send` vs `send_line`).
#[must_use]
pub fn encode_text(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Encode a typed frame as `NUL "[" TYPE "]" json "\n"`. The payload must
/// serialize to JSON; the type must be in the registered set (enforced by
/// construction, since `FrameType` is closed).
pub fn encode_frame<P: Serialize>(ty: FrameType, payload: &P) -> Result<Bytes, CodecError> {
    let json = serde_json::to_string(payload)?;
    if json.len() > MAX_FRAME_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(json.len()));
    }
    let mut out = Vec::with_capacity(json.len() + 16);
    out.push(0u8);
    out.push(b'[');
    out.extend_from_slice(ty.to_string().as_bytes());
    out.push(b']');
    out.extend_from_slice(json.as_bytes());
    out.push(b'\n');
    Ok(Bytes::from(out))
}

/// Decode one inbound client message. Plain text (no NUL prefix) is a
/// command line. A NUL prefix means the same `\x00[TYPE]<json>` envelope
/// the server emits; only `AUTH`, `SESSION`, `COMMAND`, `IDE` and `PONG`
/// are accepted from clients.
pub fn decode_inbound(bytes: &[u8]) -> Result<Inbound, CodecError> {
    if bytes.len() > MAX_FRAME_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(bytes.len()));
    }
    let Some((&0u8, rest)) = bytes.split_first() else {
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::BadEncoding)?;
        return Ok(Inbound::Text(text.trim_end_matches(['\r', '\n']).to_string()));
    };

    let Some(rest) = rest.strip_prefix(b"[") else {
        return Err(CodecError::MalformedEnvelope);
    };
    let Some(close_idx) = rest.iter().position(|&b| b == b']') else {
        return Err(CodecError::MalformedEnvelope);
    };
    let type_name =
        std::str::from_utf8(&rest[..close_idx]).map_err(|_| CodecError::BadEncoding)?;
    let body = &rest[close_idx + 1..];
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    let body_str = std::str::from_utf8(body).map_err(|_| CodecError::BadEncoding)?;

    // COMMAND and PONG are inbound-only envelopes, outside the registry.
    match type_name {
        "COMMAND" => {
            // Body may be a bare string, a JSON string, or absent.
            let line = match serde_json::from_str::<String>(body_str) {
                Ok(s) => s,
                Err(_) => body_str.to_string(),
            };
            return Ok(Inbound::Command(line.trim_end_matches(['\r', '\n']).to_string()));
        }
        "PONG" => return Ok(Inbound::Pong),
        _ => {}
    }

    let Some(ty) = FrameType::registered(type_name) else {
        return Err(CodecError::UnknownType(type_name.to_string()));
    };
    match ty {
        FrameType::Auth => Ok(Inbound::Auth(serde_json::from_str(body_str)?)),
        FrameType::Session => Ok(Inbound::Session(serde_json::from_str(body_str)?)),
        FrameType::Ide => Ok(Inbound::Ide(serde_json::from_str(body_str)?)),
        other => Err(CodecError::UnexpectedInbound(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::payloads::{IdeAction, TimePayload};
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_envelope_shape() {
        let payload = TimePayload {
            server_ms: 1234,
            game_version: "ember test".into(),
        };
        let bytes = encode_frame(FrameType::Time, &payload).unwrap();
        assert_eq!(bytes[0], 0u8);
        assert!(bytes.ends_with(b"\n"));
        let s = std::str::from_utf8(&bytes[1..]).unwrap();
        assert!(s.starts_with("[TIME]{"));
    }

    #[test]
    fn plain_text_is_a_command_line() {
        let decoded = decode_inbound(b"look at deer\r\n").unwrap();
        assert_eq!(decoded, Inbound::Text("look at deer".into()));
    }

    #[test]
    fn command_envelope() {
        let decoded = decode_inbound(b"\x00[COMMAND]\"kill deer 2\"").unwrap();
        assert_eq!(decoded, Inbound::Command("kill deer 2".into()));
        let decoded = decode_inbound(b"\x00[COMMAND]who\n").unwrap();
        assert_eq!(decoded, Inbound::Command("who".into()));
    }

    #[test]
    fn auth_envelope() {
        let decoded =
            decode_inbound(b"\x00[AUTH]{\"name\":\"Alice\",\"password\":\"hunter2\"}").unwrap();
        let Inbound::Auth(req) = decoded else {
            panic!("expected auth");
        };
        assert_eq!(req.name.as_deref(), Some("Alice"));
        assert_eq!(req.password.as_deref(), Some("hunter2"));
        assert!(req.session_token.is_none());
    }

    #[test]
    fn session_resume_envelope() {
        let decoded = decode_inbound(b"\x00[SESSION]{\"token\":\"abc.def\"}").unwrap();
        assert_eq!(
            decoded,
            Inbound::Session(SessionResume {
                token: "abc.def".into()
            })
        );
    }

    #[test]
    fn ide_envelope() {
        let decoded =
            decode_inbound(b"\x00[IDE]{\"action\":\"open\",\"path\":\"areas/glade.js\"}").unwrap();
        let Inbound::Ide(req) = decoded else {
            panic!("expected ide");
        };
        assert_eq!(req.action, IdeAction::Open);
        assert_eq!(req.path, "areas/glade.js");
    }

    #[test]
    fn pong_envelope() {
        assert_eq!(decode_inbound(b"\x00[PONG]").unwrap(), Inbound::Pong);
        assert_eq!(decode_inbound(b"\x00[PONG]{}").unwrap(), Inbound::Pong);
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let err = decode_inbound(b"\x00[TELEPORT]{}").unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t == "TELEPORT"));
    }

    #[test]
    fn registered_but_server_only_type_rejected_inbound() {
        let err = decode_inbound(b"\x00[STATS]{}").unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedInbound(FrameType::Stats)
        ));
    }

    #[test]
    fn malformed_envelope() {
        assert!(matches!(
            decode_inbound(b"\x00STATS{}"),
            Err(CodecError::MalformedEnvelope)
        ));
        assert!(matches!(
            decode_inbound(b"\x00[STATS{}"),
            Err(CodecError::MalformedEnvelope)
        ));
    }

    #[test]
    fn oversize_rejected() {
        let big = vec![b'a'; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            decode_inbound(&big),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn all_sixteen_types_registered() {
        let names = [
            "STATS",
            "MAP",
            "COMBAT",
            "EQUIPMENT",
            "QUEST",
            "COMM",
            "SOUND",
            "GIPHY",
            "IDE",
            "GUI",
            "SESSION",
            "TIME",
            "GAMETIME",
            "COMPLETION",
            "AUTH",
            "VISIBILITY",
        ];
        for name in names {
            assert!(FrameType::registered(name).is_some(), "missing {name}");
        }
        assert_eq!(FrameType::iter().count(), names.len());
        assert!(FrameType::registered("PONG").is_none());
        assert!(FrameType::registered("COMMAND").is_none());
    }
}
