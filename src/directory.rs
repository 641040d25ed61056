use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{EngineError, NotFound};
use crate::gate::{AccessGate, Directory};
use crate::model::{Room, RoomId, UserId};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("reading directory file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing directory file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("room {room} references unknown building {building}")]
    UnknownBuilding { room: RoomId, building: Ulid },
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<UserId>,
    #[serde(default)]
    buildings: Vec<BuildingEntry>,
    #[serde(default)]
    rooms: Vec<RoomEntry>,
}

#[derive(Debug, Deserialize)]
struct BuildingEntry {
    id: Ulid,
    #[serde(default)]
    members: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct RoomEntry {
    id: RoomId,
    building_id: Ulid,
    name: Option<String>,
    capacity: Option<u32>,
}

/// Read-only organization registry: known users, buildings with their
/// members, and the rooms inside each building.
///
/// A user may act on a room when they are a member of the room's building.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    users: HashSet<UserId>,
    members: HashMap<Ulid, HashSet<UserId>>,
    rooms: HashMap<RoomId, (Ulid, Room)>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = serde_json::from_str(raw)?;
        let mut dir = Self::new();
        for user in file.users {
            dir.add_user(user);
        }
        for building in file.buildings {
            dir.add_building(building.id, building.members);
        }
        for room in file.rooms {
            if !dir.members.contains_key(&room.building_id) {
                return Err(DirectoryError::UnknownBuilding {
                    room: room.id,
                    building: room.building_id,
                });
            }
            dir.add_room(
                room.building_id,
                Room {
                    id: room.id,
                    name: room.name,
                    capacity: room.capacity,
                },
            );
        }
        Ok(dir)
    }

    pub fn add_user(&mut self, id: UserId) -> &mut Self {
        self.users.insert(id);
        self
    }

    /// Register a building. Members are registered as users too.
    pub fn add_building(&mut self, id: Ulid, members: impl IntoIterator<Item = UserId>) -> &mut Self {
        let entry = self.members.entry(id).or_default();
        for member in members {
            entry.insert(member);
            self.users.insert(member);
        }
        self
    }

    pub fn add_room(&mut self, building: Ulid, room: Room) -> &mut Self {
        self.members.entry(building).or_default();
        self.rooms.insert(room.id, (building, room));
        self
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl AccessGate for StaticDirectory {
    async fn authorize(&self, room_id: RoomId, user_id: UserId) -> Result<Room, EngineError> {
        let (building, room) = self.rooms.get(&room_id).ok_or(NotFound::Room(room_id))?;
        let allowed = self
            .members
            .get(building)
            .is_some_and(|members| members.contains(&user_id));
        if !allowed {
            return Err(EngineError::forbidden(format!(
                "user {user_id} has no access to room {room_id}"
            )));
        }
        Ok(room.clone())
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn missing_users(&self, ids: &[UserId]) -> Vec<UserId> {
        ids.iter().filter(|id| !self.users.contains(*id)).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILDING: &str = "01J0000000000000000000B001";
    const ROOM: &str = "01J0000000000000000000R001";
    const ALICE: &str = "01J0000000000000000000A001";
    const BOB: &str = "01J0000000000000000000A002";
    const CAROL: &str = "01J0000000000000000000A003";

    fn id(raw: &str) -> Ulid {
        Ulid::from_string(raw).unwrap()
    }

    fn sample() -> StaticDirectory {
        let json = format!(
            r#"{{
                "users": ["{CAROL}"],
                "buildings": [{{ "id": "{BUILDING}", "members": ["{ALICE}", "{BOB}"] }}],
                "rooms": [{{ "id": "{ROOM}", "building_id": "{BUILDING}", "name": "Aurora", "capacity": 6 }}]
            }}"#
        );
        StaticDirectory::from_json(&json).unwrap()
    }

    #[test]
    fn loads_json_registry() {
        let dir = sample();
        assert_eq!(dir.room_count(), 1);
        assert_eq!(dir.user_count(), 3);
    }

    #[tokio::test]
    async fn member_is_authorized() {
        let room = sample().authorize(id(ROOM), id(ALICE)).await.unwrap();
        assert_eq!(room.name.as_deref(), Some("Aurora"));
        assert_eq!(room.capacity, Some(6));
    }

    #[tokio::test]
    async fn non_member_is_forbidden() {
        let err = sample().authorize(id(ROOM), id(CAROL)).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let ghost = Ulid::new();
        let err = sample().authorize(ghost, id(ALICE)).await.unwrap_err();
        assert_eq!(err, EngineError::NotFound(NotFound::Room(ghost)));
    }

    #[tokio::test]
    async fn missing_users_keeps_input_order() {
        let (x, y) = (Ulid::new(), Ulid::new());
        let missing = sample().missing_users(&[x, id(BOB), y, id(CAROL)]).await;
        assert_eq!(missing, vec![x, y]);
    }

    #[test]
    fn room_in_unknown_building_is_rejected() {
        let json = format!(r#"{{ "rooms": [{{ "id": "{ROOM}", "building_id": "{BUILDING}" }}] }}"#);
        assert!(matches!(
            StaticDirectory::from_json(&json),
            Err(DirectoryError::UnknownBuilding { .. })
        ));
    }
}
