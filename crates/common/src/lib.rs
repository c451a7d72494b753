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

//! Types shared by every crate in the ember workspace: the wire protocol
//! codec, the error taxonomy, object ids, and permission levels.

pub use errors::ErrorKind;
pub use ids::ObjId;
pub use perms::PermissionLevel;
pub use proto::close::{CloseCode, DisconnectReason};
pub use proto::frame::{
    CodecError, FrameType, Inbound, MAX_FRAME_PAYLOAD, decode_inbound, encode_frame, encode_text,
};

pub mod build;
pub mod errors;
pub mod ids;
pub mod perms;
pub mod proto;
