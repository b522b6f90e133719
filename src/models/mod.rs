//! Domain models for the island real-time core.
//!
//! # Core Concepts
//!
//! ## Durable Entities
//!
//! These live in the persistence tier and are only read and written through
//! [`crate::store::PersistenceAdapter`]:
//!
//! - [`Player`]: Crystals, xp and mana of one account. Owns exactly one island.
//! - [`Placeable`]: Anything positioned on an island grid. A tagged variant,
//!   either an entity (props) or a building (altar, mine, tower, ...).
//! - [`Blueprint`]: Immutable reference data with the cost and build time of a
//!   placeable type.
//! - [`Task`]: A timed build, upgrade or mine operation on a placeable.
//! - [`Gem`]: Crafted gems whose attribute multipliers boost building output.
//! - [`ChatMessage`]: A message of the global chat.
//!
//! ## Ephemeral State
//!
//! These exist only in core memory:
//!
//! - Battle sessions (see [`crate::battle`]); only their [`BattleOutcome`] is
//!   committed when they close.
//! - Island visits ([`Visit`]), tracked next to battles.
//! - Registry entries (see [`crate::registry`]).
//!
//! Channel messages exchanged with clients are in [`InboundEvent`] and
//! [`OutboundEvent`].

mod battle;
mod blueprint;
mod chat;
mod events;
mod gem;
mod ids;
mod placeable;
mod player;
mod task;
mod visit;

pub use battle::*;
pub use blueprint::*;
pub use chat::*;
pub use events::*;
pub use gem::*;
pub use ids::*;
pub use placeable::*;
pub use player::*;
pub use task::*;
pub use visit::*;
