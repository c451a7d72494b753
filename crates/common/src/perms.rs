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
use strum::{Display, EnumIter, EnumString};

/// Permission levels, ordered. Commands declare a minimum level; commands
/// above a player's level are invisible at lookup time so they can never
/// collide with content verbs.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionLevel {
    Player,
    Builder,
    SeniorBuilder,
    Admin,
}

impl Default for PermissionLevel {
    fn default() -> Self {
        Self::Player
    }
}

impl PermissionLevel {
    /// True if a holder of `self` may use something gated at `required`.
    #[must_use]
    pub fn satisfies(&self, required: PermissionLevel) -> bool {
        *self >= required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn ordering() {
        assert!(PermissionLevel::Admin.satisfies(PermissionLevel::Builder));
        assert!(PermissionLevel::Builder.satisfies(PermissionLevel::Player));
        assert!(!PermissionLevel::Player.satisfies(PermissionLevel::SeniorBuilder));
        assert!(PermissionLevel::Player.satisfies(PermissionLevel::Player));
    }

    #[test]
    fn parse_round_trip() {
        for s in ["player", "builder", "senior_builder", "admin"] {
            let lvl = PermissionLevel::from_str(s).unwrap();
            assert_eq!(lvl.to_string(), s);
        }
        assert!(PermissionLevel::from_str("wizard").is_err());
    }
}
