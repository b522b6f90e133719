use serde::{Deserialize, Serialize};

use super::{GemId, PlaceableId, PlayerId};

/// A crafted gem. Attached to a building it multiplies the building's output;
/// staked, it is at risk in the owner's next battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gem {
    pub id: GemId,
    pub owner: PlayerId,
    pub building_id: Option<PlaceableId>,
    pub staked: bool,
    pub attributes: Vec<GemAttribute>,
}

/// One attribute of a gem. Multipliers are never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemAttribute {
    pub attribute_id: i64,
    pub name: String,
    pub multiplier: f64,
}

/// Input for creating a gem with `(attribute_id, multiplier)` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGemInput {
    pub owner: PlayerId,
    pub building_id: Option<PlaceableId>,
    pub staked: bool,
    pub attributes: Vec<(i64, f64)>,
}

/// Combined output multiplier of the gems attached to one building.
///
/// Multipliers compose multiplicatively; a building without gems has a
/// multiplier of 1.0.
pub fn combined_multiplier(gems: &[Gem]) -> f64 {
    gems.iter()
        .flat_map(|gem| gem.attributes.iter())
        .map(|attr| attr.multiplier.max(0.0))
        .product()
}
