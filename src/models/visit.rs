use serde::{Deserialize, Serialize};

use super::PlayerId;

/// Step of the island visit handshake.
///
/// A guest sends `request` to a host, who answers `accept` or `decline`.
/// Once accepted either side can end the visit: the guest with `leave`, the
/// host with `kick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitRequest {
    Request,
    Accept,
    Decline,
    Leave,
    Kick,
}

/// An accepted visit of `guest` on the island of `host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub host: PlayerId,
    pub guest: PlayerId,
}

impl Visit {
    pub fn involves(&self, player: PlayerId) -> bool {
        self.host == player || self.guest == player
    }

    /// The other participant, if `player` takes part.
    pub fn partner_of(&self, player: PlayerId) -> Option<PlayerId> {
        if player == self.host {
            Some(self.guest)
        } else if player == self.guest {
            Some(self.host)
        } else {
            None
        }
    }
}
