//! Real-time core of an idle island builder.
//!
//! Two stateful subsystems share one process: the progression engine, which
//! completes timed builds, upgrades and digs and derives resource growth
//! lazily from elapsed time, and the battle coordinator, which matches
//! connected players and sequences their battles. Both reach clients through
//! the session registry and durable state through a
//! [`store::PersistenceAdapter`].

pub mod accumulator;
pub mod api;
pub mod battle;
pub mod chat;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod progression;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;
