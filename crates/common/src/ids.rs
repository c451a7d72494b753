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

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable runtime id for a registered world object. Assigned at register
/// time, never reused within a process lifetime. Cross-object references
/// (combat target, pet owner, effect source) store these rather than
/// pointers, so a destroyed object leaves dangling ids, not dangling
/// memory.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ObjId(pub u64);

impl ObjId {
    pub const NONE: ObjId = ObjId(0);

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for ObjId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid object id: {0}")]
pub struct ParseObjIdError(String);

impl FromStr for ObjId {
    type Err = ParseObjIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('#').unwrap_or(s);
        digits
            .parse::<u64>()
            .map(ObjId)
            .map_err(|_| ParseObjIdError(s.to_string()))
    }
}
