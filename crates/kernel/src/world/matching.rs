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

//! Target resolution for command arguments: the `kill deer 2` problem.
//! Matching runs over the player's scope in order, case-insensitively,
//! with the usual pronouns, an optional 1-based trailing index, and
//! `all` / `all <name>` expansion.

use ember_common::ObjId;

use crate::world::World;

/// Outcome of resolving one target phrase.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetResolution {
    One(ObjId),
    /// `all` or `all <name>` expansion; in-scope matches in scope order.
    Many(Vec<ObjId>),
    NotFound(String),
    /// An explicit index was out of range: `deer 5` with three deer.
    OutOfRange { name: String, count: usize },
}

/// Resolve a target phrase against a player's scope.
#[must_use]
pub fn resolve_target(world: &World, player: ObjId, phrase: &str) -> TargetResolution {
    let phrase = phrase.trim();
    if phrase.is_empty() {
        return TargetResolution::NotFound(String::new());
    }
    let lowered = phrase.to_lowercase();

    match lowered.as_str() {
        "me" | "self" | "myself" => return TargetResolution::One(player),
        "here" => {
            return match world.get(player).and_then(|p| p.environment) {
                Some(env) => TargetResolution::One(env),
                None => TargetResolution::NotFound(phrase.to_string()),
            };
        }
        "all" => {
            let matches: Vec<ObjId> = world
                .scope_of(player)
                .into_iter()
                .filter(|&id| id != player)
                .collect();
            return TargetResolution::Many(matches);
        }
        _ => {}
    }

    // `all <name>` expands to every in-scope match.
    if let Some(name) = lowered.strip_prefix("all ") {
        let matches = matches_in_scope(world, player, name.trim());
        return TargetResolution::Many(matches);
    }

    let (name, index) = split_trailing_index(&lowered);
    let matches = matches_in_scope(world, player, name);

    match index {
        None => match matches.first() {
            Some(&id) => TargetResolution::One(id),
            None => TargetResolution::NotFound(phrase.to_string()),
        },
        Some(n) => {
            if matches.is_empty() {
                return TargetResolution::NotFound(phrase.to_string());
            }
            // 1-indexed.
            match matches.get(n - 1) {
                Some(&id) => TargetResolution::One(id),
                None => TargetResolution::OutOfRange {
                    name: name.to_string(),
                    count: matches.len(),
                },
            }
        }
    }
}

fn matches_in_scope(world: &World, player: ObjId, name: &str) -> Vec<ObjId> {
    world
        .scope_of(player)
        .into_iter()
        .filter(|&id| {
            world
                .get(id)
                .map(|obj| obj.id_match(name))
                .unwrap_or(false)
        })
        .collect()
}

/// Split an optional 1-based trailing index off a phrase: `deer 2` ->
/// (`deer`, Some(2)). A lone number is a name, not an index.
fn split_trailing_index(phrase: &str) -> (&str, Option<usize>) {
    let Some((head, tail)) = phrase.rsplit_once(' ') else {
        return (phrase, None);
    };
    match tail.parse::<usize>() {
        Ok(n) if n >= 1 => (head.trim_end(), Some(n)),
        _ => (phrase, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WorldObject;
    use pretty_assertions::assert_eq;

    fn deer_glade() -> (World, ObjId, Vec<ObjId>) {
        let mut world = World::new();
        let room = world.register(WorldObject::new("areas/glade", "glade"));
        let player = world.register(WorldObject::new("players/alice", "alice"));
        world.move_to(player, Some(room)).unwrap();
        let mut deer = vec![];
        for _ in 0..3 {
            let d = world.register(WorldObject::new("npcs/deer", "deer"));
            world.move_to(d, Some(room)).unwrap();
            deer.push(d);
        }
        (world, player, deer)
    }

    #[test]
    fn pronouns() {
        let (world, player, _) = deer_glade();
        assert_eq!(
            resolve_target(&world, player, "me"),
            TargetResolution::One(player)
        );
        assert_eq!(
            resolve_target(&world, player, "MYSELF"),
            TargetResolution::One(player)
        );
        let env = world.get(player).unwrap().environment.unwrap();
        assert_eq!(
            resolve_target(&world, player, "here"),
            TargetResolution::One(env)
        );
    }

    #[test]
    fn first_match_without_index() {
        let (world, player, deer) = deer_glade();
        assert_eq!(
            resolve_target(&world, player, "deer"),
            TargetResolution::One(deer[0])
        );
    }

    #[test]
    fn trailing_index_selects_nth() {
        let (world, player, deer) = deer_glade();
        assert_eq!(
            resolve_target(&world, player, "deer 2"),
            TargetResolution::One(deer[1])
        );
        assert_eq!(
            resolve_target(&world, player, "DEER 3"),
            TargetResolution::One(deer[2])
        );
    }

    #[test]
    fn index_out_of_range_reports_count() {
        let (world, player, _) = deer_glade();
        assert_eq!(
            resolve_target(&world, player, "deer 5"),
            TargetResolution::OutOfRange {
                name: "deer".into(),
                count: 3
            }
        );
    }

    #[test]
    fn zero_matches_is_not_found() {
        let (world, player, _) = deer_glade();
        assert_eq!(
            resolve_target(&world, player, "wolf"),
            TargetResolution::NotFound("wolf".into())
        );
        assert_eq!(
            resolve_target(&world, player, "wolf 2"),
            TargetResolution::NotFound("wolf 2".into())
        );
    }

    #[test]
    fn all_and_all_of_name() {
        let (world, player, deer) = deer_glade();
        let TargetResolution::Many(everything) = resolve_target(&world, player, "all") else {
            panic!("expected Many");
        };
        // Room plus the three deer; never the player themselves.
        assert_eq!(everything.len(), 4);
        assert!(!everything.contains(&player));

        assert_eq!(
            resolve_target(&world, player, "all deer"),
            TargetResolution::Many(deer.clone())
        );
        assert_eq!(
            resolve_target(&world, player, "all wolf"),
            TargetResolution::Many(vec![])
        );
    }

    #[test]
    fn lone_number_is_a_name() {
        let (mut world, player, _) = deer_glade();
        let room = world.get(player).unwrap().environment.unwrap();
        let odd = world.register(WorldObject::new("items/odd", "42"));
        world.move_to(odd, Some(room)).unwrap();
        assert_eq!(
            resolve_target(&world, player, "42"),
            TargetResolution::One(odd)
        );
    }
}
