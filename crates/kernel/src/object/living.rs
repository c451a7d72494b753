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

//! The Living capability: vitals, stats, effects, combat state. Shared by
//! players and NPCs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ember_common::ObjId;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    #[default]
    Standing,
    Sitting,
    Resting,
    Prone,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub strength: i32,
    pub agility: i32,
    pub intellect: i32,
    pub vitality: i32,
}

/// A timed (or permanent) effect on a Living.
///
/// `remaining == None` means permanent: removed only by explicit
/// cancellation. An effect with a `tick_interval` fires its tick action
/// each time the interval elapses, then rearms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub id: String,
    /// Content-defined effect type ("poison", "haste", ...).
    pub kind: String,
    /// None = permanent.
    #[serde(with = "opt_millis")]
    pub remaining: Option<Duration>,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub tick_interval: Option<Duration>,
    /// Time until the next interval tick fires.
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub next_tick: Option<Duration>,
    pub magnitude: f64,
    pub category: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

/// What one heartbeat did to one effect.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EffectTick {
    pub fired: bool,
    pub expired: bool,
}

impl Effect {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.remaining.is_none()
    }

    /// Advance by one tick period. Decrements the remaining duration,
    /// fires and rearms the interval tick when due, and reports expiry
    /// once remaining reaches zero.
    pub fn advance(&mut self, period: Duration) -> EffectTick {
        let mut result = EffectTick::default();

        if let Some(interval) = self.tick_interval {
            let next = self.next_tick.unwrap_or(interval);
            match next.checked_sub(period) {
                Some(left) if !left.is_zero() => self.next_tick = Some(left),
                _ => {
                    result.fired = true;
                    self.next_tick = Some(interval);
                }
            }
        }

        if let Some(remaining) = self.remaining {
            let left = remaining.saturating_sub(period);
            self.remaining = Some(left);
            if left.is_zero() {
                result.expired = true;
            }
        }

        result
    }
}

mod opt_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Option::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LivingState {
    pub hp: i64,
    pub max_hp: i64,
    pub mp: i64,
    pub max_mp: i64,
    pub base_stats: Stats,
    pub stat_modifiers: Stats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<Effect>,
    /// Id-indexed weak reference; validity checked against the registry
    /// on every use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combat_target: Option<ObjId>,
    pub encumbrance: f32,
    #[serde(default)]
    pub posture: Posture,
    /// Regen per tick, applied by the heartbeat.
    #[serde(default)]
    pub hp_regen: i64,
    #[serde(default)]
    pub mp_regen: i64,
}

impl LivingState {
    /// Heartbeat regen: clamped to maxima, modified by posture.
    pub fn apply_regen(&mut self) {
        let multiplier = match self.posture {
            Posture::Resting | Posture::Sitting => 2,
            Posture::Standing => 1,
            Posture::Prone => 0,
        };
        self.hp = (self.hp + self.hp_regen * multiplier).min(self.max_hp);
        self.mp = (self.mp + self.mp_regen * multiplier).min(self.max_mp);
    }

    #[must_use]
    pub fn effective_stats(&self) -> Stats {
        Stats {
            strength: self.base_stats.strength + self.stat_modifiers.strength,
            agility: self.base_stats.agility + self.stat_modifiers.agility,
            intellect: self.base_stats.intellect + self.stat_modifiers.intellect,
            vitality: self.base_stats.vitality + self.stat_modifiers.vitality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn effect(remaining_ms: Option<u64>, interval_ms: Option<u64>) -> Effect {
        Effect {
            id: "e1".into(),
            kind: "poison".into(),
            remaining: remaining_ms.map(Duration::from_millis),
            tick_interval: interval_ms.map(Duration::from_millis),
            next_tick: None,
            magnitude: 2.0,
            category: "damage".into(),
            hidden: false,
        }
    }

    #[test]
    fn permanent_effects_never_expire() {
        let mut e = effect(None, None);
        for _ in 0..1000 {
            let tick = e.advance(Duration::from_secs(1));
            assert!(!tick.expired);
        }
        assert!(e.is_permanent());
    }

    #[test]
    fn timed_effect_expires_when_drained() {
        let mut e = effect(Some(2500), None);
        assert!(!e.advance(Duration::from_secs(1)).expired);
        assert!(!e.advance(Duration::from_secs(1)).expired);
        let tick = e.advance(Duration::from_secs(1));
        assert!(tick.expired);
    }

    #[test]
    fn interval_tick_fires_and_rearms() {
        let mut e = effect(Some(10_000), Some(3000));
        let mut fired = 0;
        for _ in 0..9 {
            if e.advance(Duration::from_secs(1)).fired {
                fired += 1;
            }
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn regen_respects_posture_and_maxima() {
        let mut living = LivingState {
            hp: 10,
            max_hp: 20,
            mp: 5,
            max_mp: 5,
            hp_regen: 3,
            mp_regen: 1,
            ..Default::default()
        };
        living.apply_regen();
        assert_eq!(living.hp, 13);
        assert_eq!(living.mp, 5);

        living.posture = Posture::Resting;
        living.apply_regen();
        assert_eq!(living.hp, 19);

        living.apply_regen();
        assert_eq!(living.hp, 20);

        living.posture = Posture::Prone;
        living.hp = 1;
        living.apply_regen();
        assert_eq!(living.hp, 1);
    }

    #[test]
    fn effect_millis_round_trip() {
        let e = effect(Some(1500), Some(500));
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["remaining"], 1500);
        let back: Effect = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}
