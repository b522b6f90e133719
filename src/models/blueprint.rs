use serde::{Deserialize, Serialize};

use super::BlueprintId;

/// Template for a placeable type. Immutable reference data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: BlueprintId,
    pub name: String,
    pub description: String,
    pub kind: BlueprintKind,
    /// Crystal cost of the initial build.
    pub cost: i64,
    /// Build time of the initial build, in seconds.
    pub buildtime_secs: i64,
}

impl Blueprint {
    /// Crystal cost of bringing a placeable to `to_level`.
    ///
    /// Level 1 is the initial build and costs exactly the blueprint cost;
    /// every further level scales linearly.
    pub fn cost_for_level(&self, to_level: i32) -> i64 {
        self.cost * i64::from(to_level.max(1))
    }

    /// Duration, in seconds, of bringing a placeable to `to_level`.
    pub fn buildtime_for_level(&self, to_level: i32) -> i64 {
        self.buildtime_secs * i64::from(to_level.max(1))
    }
}

/// What a blueprint produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintKind {
    Altar,
    Mine,
    Tower,
    FuseTable,
    WarriorHut,
    Wall,
    Bush,
    Tree,
}

impl BlueprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Altar => "altar",
            Self::Mine => "mine",
            Self::Tower => "tower",
            Self::FuseTable => "fuse_table",
            Self::WarriorHut => "warrior_hut",
            Self::Wall => "wall",
            Self::Bush => "bush",
            Self::Tree => "tree",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "altar" => Some(Self::Altar),
            "mine" => Some(Self::Mine),
            "tower" => Some(Self::Tower),
            "fuse_table" => Some(Self::FuseTable),
            "warrior_hut" => Some(Self::WarriorHut),
            "wall" => Some(Self::Wall),
            "bush" => Some(Self::Bush),
            "tree" => Some(Self::Tree),
            _ => None,
        }
    }

    /// Props are entities; everything else is a building.
    pub fn is_building(&self) -> bool {
        !matches!(self, Self::Bush | Self::Tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tower() -> Blueprint {
        Blueprint {
            id: BlueprintId(3),
            name: "Tower".to_string(),
            description: String::new(),
            kind: BlueprintKind::Tower,
            cost: 200,
            buildtime_secs: 60,
        }
    }

    #[test]
    fn level_curve_is_linear() {
        let bp = tower();
        assert_eq!(bp.cost_for_level(1), 200);
        assert_eq!(bp.cost_for_level(3), 600);
        assert_eq!(bp.buildtime_for_level(2), 120);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [BlueprintKind::FuseTable, BlueprintKind::Bush, BlueprintKind::Mine] {
            assert_eq!(BlueprintKind::from_str(kind.as_str()), Some(kind));
        }
        assert!(BlueprintKind::from_str("castle").is_none());
    }

    #[test]
    fn props_are_not_buildings() {
        assert!(!BlueprintKind::Tree.is_building());
        assert!(BlueprintKind::Wall.is_building());
    }
}
