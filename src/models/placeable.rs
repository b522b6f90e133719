use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BlueprintId, BlueprintKind, PlaceableId, PlayerId};

/// Grid bounds of an island, inclusive on both axes.
pub const GRID_MIN: i32 = -7;
pub const GRID_MAX: i32 = 7;

/// Anything positioned on an island grid.
///
/// The variant specific state lives in [`PlaceableKind`]; code that needs to
/// treat mines, buildings and props differently matches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeable {
    pub id: PlaceableId,
    /// Owner of the island this placeable stands on.
    pub owner: PlayerId,
    pub blueprint_id: BlueprintId,
    pub x: i32,
    pub z: i32,
    pub rotation: Rotation,
    pub level: i32,
    pub kind: PlaceableKind,
}

impl Placeable {
    pub fn is_building(&self) -> bool {
        matches!(self.kind, PlaceableKind::Building(_))
    }

    pub fn mine(&self) -> Option<&MineState> {
        match &self.kind {
            PlaceableKind::Building(BuildingKind::Mine(state)) => Some(state),
            _ => None,
        }
    }

    pub fn mine_mut(&mut self) -> Option<&mut MineState> {
        match &mut self.kind {
            PlaceableKind::Building(BuildingKind::Mine(state)) => Some(state),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_cell(self.x, self.z)?;
        if self.level < 0 {
            return Err(format!("level must be >= 0, got {}", self.level));
        }
        Ok(())
    }
}

/// Check that a cell lies on the island grid.
pub fn validate_cell(x: i32, z: i32) -> Result<(), String> {
    let range = GRID_MIN..=GRID_MAX;
    if !range.contains(&x) || !range.contains(&z) {
        return Err(format!(
            "position ({}, {}) is out of bounds [{}, {}]",
            x, z, GRID_MIN, GRID_MAX
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "snake_case")]
pub enum PlaceableKind {
    Entity(EntityKind),
    Building(BuildingKind),
}

impl PlaceableKind {
    /// The initial variant state for a freshly placed blueprint.
    pub fn for_blueprint(kind: BlueprintKind, now: DateTime<Utc>) -> Self {
        match kind {
            BlueprintKind::Bush => Self::Entity(EntityKind::Bush),
            BlueprintKind::Tree => Self::Entity(EntityKind::Tree),
            BlueprintKind::Altar => Self::Building(BuildingKind::Altar),
            BlueprintKind::Mine => Self::Building(BuildingKind::Mine(MineState {
                mine_type: MineType::Crystal,
                last_collected: now,
                banked: 0,
            })),
            BlueprintKind::Tower => Self::Building(BuildingKind::Tower),
            BlueprintKind::FuseTable => Self::Building(BuildingKind::FuseTable),
            BlueprintKind::WarriorHut => Self::Building(BuildingKind::WarriorHut),
            BlueprintKind::Wall => Self::Building(BuildingKind::Wall),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Bush,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildingKind {
    Altar,
    Mine(MineState),
    Tower,
    FuseTable,
    WarriorHut,
    Wall,
}

/// Accumulation state of a mine.
///
/// The amount mined in the current window is never stored: it is derived
/// from the production rate, `last_collected` and the current instant. Only
/// output of earlier windows, produced at a rate that no longer applies, is
/// kept in `banked` until the next collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MineState {
    pub mine_type: MineType,
    /// Origin of the current accumulation window.
    pub last_collected: DateTime<Utc>,
    #[serde(default)]
    pub banked: i64,
}

/// A mine's window closed at a rate change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MineSettlement {
    pub placeable_id: PlaceableId,
    /// Total banked on the mine after the settlement.
    pub banked: i64,
    /// Origin of the window that starts at the new rate.
    pub last_collected: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MineType {
    Crystal,
}

impl MineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crystal => "crystal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "crystal" => Some(Self::Crystal),
            _ => None,
        }
    }
}

/// Facing of a placeable: 0 = north, 1 = east, 2 = south, 3 = west.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum Rotation {
    North,
    East,
    South,
    West,
}

impl TryFrom<u8> for Rotation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::North),
            1 => Ok(Self::East),
            2 => Ok(Self::South),
            3 => Ok(Self::West),
            other => Err(format!("rotation {} is out of bounds [0, 3]", other)),
        }
    }
}

impl From<Rotation> for u8 {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::North => 0,
            Rotation::East => 1,
            Rotation::South => 2,
            Rotation::West => 3,
        }
    }
}

/// Input for placing a new placeable on an island.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlaceable {
    pub owner: PlayerId,
    pub blueprint_id: BlueprintId,
    pub x: i32,
    pub z: i32,
    pub rotation: Rotation,
    pub kind: PlaceableKind,
}
