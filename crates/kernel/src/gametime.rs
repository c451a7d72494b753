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

//! The in-world clock. Game time runs faster than wall time by a fixed
//! ratio and is derived, not stored: the same wall instant always maps
//! to the same game instant, so a restart does not slew the day.

use std::time::{SystemTime, UNIX_EPOCH};

use ember_common::proto::payloads::GameTimePayload;

const SECONDS_PER_MINUTE: u64 = 60;
const MINUTES_PER_HOUR: u64 = 60;
const HOURS_PER_DAY: u64 = 24;

#[derive(Clone, Copy, Debug)]
pub struct GameClock {
    /// Wall-clock milliseconds at game epoch.
    epoch_ms: u64,
    /// Game seconds per real second.
    ratio: u64,
}

impl Default for GameClock {
    fn default() -> Self {
        // A full game day every two real hours.
        Self::new(0, 12)
    }
}

impl GameClock {
    #[must_use]
    pub fn new(epoch_ms: u64, ratio: u64) -> Self {
        Self {
            epoch_ms,
            ratio: ratio.max(1),
        }
    }

    /// The game time for a wall-clock timestamp.
    #[must_use]
    pub fn at(&self, wall_ms: u64) -> GameTimePayload {
        let elapsed_ms = wall_ms.saturating_sub(self.epoch_ms);
        let game_seconds = elapsed_ms / 1000 * self.ratio;
        let minutes = game_seconds / SECONDS_PER_MINUTE;
        GameTimePayload {
            epoch: game_seconds,
            day: (minutes / (MINUTES_PER_HOUR * HOURS_PER_DAY)) as u32,
            hour: ((minutes / MINUTES_PER_HOUR) % HOURS_PER_DAY) as u8,
            minute: (minutes % MINUTES_PER_HOUR) as u8,
        }
    }

    #[must_use]
    pub fn now(&self) -> GameTimePayload {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.at(wall_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_advances_at_ratio() {
        let clock = GameClock::new(0, 12);
        let t0 = clock.at(0);
        assert_eq!((t0.day, t0.hour, t0.minute), (0, 0, 0));

        // Five real minutes = one game hour at 12x.
        let t1 = clock.at(5 * 60 * 1000);
        assert_eq!((t1.day, t1.hour, t1.minute), (0, 1, 0));

        // Two real hours = one full game day.
        let t2 = clock.at(2 * 60 * 60 * 1000);
        assert_eq!((t2.day, t2.hour, t2.minute), (1, 0, 0));
    }

    #[test]
    fn derivation_is_stable() {
        let clock = GameClock::new(1_000_000, 12);
        let a = clock.at(5_000_000);
        let b = clock.at(5_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn before_epoch_clamps_to_zero() {
        let clock = GameClock::new(1_000_000, 12);
        let t = clock.at(0);
        assert_eq!(t.epoch, 0);
    }
}
