mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::*;
use crate::store::{IdentityResolver, PersistenceAdapter, StoreResult};

/// SQLite backed durable store.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const PLACEABLE_COLUMNS: &str =
    "id, owner_id, blueprint_id, category, kind, x, z, rotation, level, mine_type, last_collected, banked";

const TASK_COLUMNS: &str =
    "id, owner_id, placeable_id, kind, yield_amount, used_crystals, to_level, started_at, duration_secs, status, attempts";

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "island-realtime")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        let db_path = dirs.data_dir().join("islands.db");
        Self::open(db_path)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let applied = schema::run_migrations(&conn)?;
        if !applied.is_empty() {
            tracing::info!(?applied, "Database schema updated");
        }
        Ok(())
    }

    // ============================================================
    // Player operations
    // ============================================================

    pub fn create_player(&self, input: CreatePlayerInput) -> StoreResult<Player> {
        let player = Player {
            id: input.id,
            crystals: input.crystals,
            xp: input.xp,
            mana: input.mana,
            mana_updated_at: input.now,
        };
        player.validate().map_err(StoreError::Validation)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "INSERT INTO players (id, crystals, xp, mana, mana_updated_at) VALUES (?, ?, ?, ?, ?)",
            (
                player.id.0,
                player.crystals,
                player.xp,
                player.mana,
                format_datetime(player.mana_updated_at),
            ),
        )?;
        conn.execute(
            "INSERT INTO player_stats (player_id) VALUES (?)",
            [player.id.0],
        )?;

        Ok(player)
    }

    pub fn get_player_stats(&self, id: PlayerId) -> StoreResult<PlayerStats> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.query_row(
            "SELECT player_id, games_played, games_won, damage_dealt, damage_taken,
                    mana_spent, spell_casts, gems_won, gems_lost
             FROM player_stats WHERE player_id = ?",
            [id.0],
            |row| {
                Ok(PlayerStats {
                    player_id: PlayerId(row.get(0)?),
                    games_played: row.get(1)?,
                    games_won: row.get(2)?,
                    damage_dealt: row.get(3)?,
                    damage_taken: row.get(4)?,
                    mana_spent: row.get(5)?,
                    spell_casts: row.get(6)?,
                    gems_won: row.get(7)?,
                    gems_lost: row.get(8)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("stats of player {}", id)))
    }

    // ============================================================
    // Blueprint operations
    // ============================================================

    pub fn get_all_blueprints(&self) -> StoreResult<Vec<Blueprint>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, description, kind, cost, buildtime FROM blueprints ORDER BY id",
        )?;
        let blueprints = stmt
            .query_map([], blueprint_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blueprints)
    }

    // ============================================================
    // Gem operations
    // ============================================================

    pub fn create_gem(&self, input: CreateGemInput) -> StoreResult<Gem> {
        if input.staked && input.building_id.is_some() {
            return Err(StoreError::Validation(
                "a staked gem cannot be attached to a building".to_string(),
            ));
        }
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO gems (owner_id, building_id, staked) VALUES (?, ?, ?)",
            (
                input.owner.0,
                input.building_id.map(|b| b.0),
                input.staked as i32,
            ),
        )?;
        let gem_id = GemId(tx.last_insert_rowid());

        for (attribute_id, multiplier) in &input.attributes {
            if *multiplier < 0.0 {
                return Err(StoreError::Validation(format!(
                    "gem multiplier must be >= 0, got {}",
                    multiplier
                )));
            }
            tx.execute(
                "INSERT INTO gem_attribute_values (gem_id, attribute_id, multiplier) VALUES (?, ?, ?)",
                (gem_id.0, attribute_id, multiplier),
            )?;
        }

        let gem = load_gem(&tx, gem_id)?;
        tx.commit()?;
        Ok(gem)
    }

    pub fn get_player_gems(&self, owner: PlayerId) -> StoreResult<Vec<Gem>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM gems WHERE owner_id = ? ORDER BY id")?;
            let ids = stmt
                .query_map([owner.0], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        ids.into_iter().map(|id| load_gem(&conn, GemId(id))).collect()
    }

    // ============================================================
    // Sessions and chat
    // ============================================================

    /// Record a channel token issued to `player`, valid until `expires_at`.
    pub fn create_session(
        &self,
        token: &str,
        player: PlayerId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if token.is_empty() {
            return Err(StoreError::Validation("session token is empty".to_string()));
        }
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "INSERT INTO player_sessions (token, player_id, expires_at) VALUES (?, ?, ?)",
            (token, player.0, format_datetime(expires_at)),
        )?;
        Ok(())
    }

    pub fn revoke_session(&self, token: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute("DELETE FROM player_sessions WHERE token = ?", [token])?;
        Ok(())
    }

    /// The latest `limit` chat messages, oldest first.
    pub fn chat_history(&self, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, player_id, message, created_at FROM chat_messages
             ORDER BY id DESC LIMIT ?",
        )?;
        let mut messages = stmt
            .query_map([limit as i64], chat_message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    // ============================================================
    // Task and battle lookups
    // ============================================================

    pub fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS),
                [id.0.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn is_applied(&self, id: TaskId) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM applied_tasks WHERE task_id = ?",
            [id.0.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_battle_outcome(&self, id: BattleId) -> StoreResult<Option<BattleOutcome>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, winner_id, reason, started_at, ended_at, participants
                 FROM battle_outcomes WHERE id = ?",
                [id.0.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, String>(2)?,
                        parse_datetime(row, 3)?,
                        parse_datetime(row, 4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((winner, reason, started_at, ended_at, participants)) = row else {
            return Ok(None);
        };

        let reason = serde_json::from_value(serde_json::Value::String(reason))
            .map_err(|e| StoreError::Validation(format!("invalid end reason: {}", e)))?;
        let participants = serde_json::from_str(&participants)
            .map_err(|e| StoreError::Validation(format!("invalid participants: {}", e)))?;

        Ok(Some(BattleOutcome {
            battle_id: id,
            winner: winner.map(PlayerId),
            reason,
            participants,
            started_at,
            ended_at,
        }))
    }
}

impl PersistenceAdapter for Database {
    fn read_player(&self, id: PlayerId) -> StoreResult<Player> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_player(&conn, id)
    }

    fn write_player(&self, player: &Player) -> StoreResult<()> {
        player.validate().map_err(StoreError::Validation)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE players SET crystals = ?, xp = ?, mana = ?, mana_updated_at = ? WHERE id = ?",
            (
                player.crystals,
                player.xp,
                player.mana,
                format_datetime(player.mana_updated_at),
                player.id.0,
            ),
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("player {}", player.id)));
        }
        Ok(())
    }

    fn read_placeable(&self, id: PlaceableId) -> StoreResult<Placeable> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_placeable(&conn, id)
    }

    fn write_placeable(&self, placeable: &Placeable) -> StoreResult<()> {
        placeable.validate().map_err(StoreError::Validation)?;

        let (mine_type, last_collected, banked) = mine_columns(&placeable.kind);
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE placeables SET x = ?, z = ?, rotation = ?, level = ?, mine_type = ?, last_collected = ?, banked = ?
             WHERE id = ? AND owner_id = ?",
            (
                placeable.x,
                placeable.z,
                u8::from(placeable.rotation),
                placeable.level,
                mine_type,
                last_collected,
                banked,
                placeable.id.0,
                placeable.owner.0,
            ),
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("placeable {}", placeable.id)));
        }
        Ok(())
    }

    fn island_placeables(&self, owner: PlayerId) -> StoreResult<Vec<Placeable>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM placeables WHERE owner_id = ? ORDER BY id",
            PLACEABLE_COLUMNS
        ))?;
        let placeables = stmt
            .query_map([owner.0], placeable_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(placeables)
    }

    fn read_blueprint(&self, id: BlueprintId) -> StoreResult<Blueprint> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.query_row(
            "SELECT id, name, description, kind, cost, buildtime FROM blueprints WHERE id = ?",
            [id.0],
            blueprint_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("blueprint {}", id)))
    }

    fn building_gems(&self, building: PlaceableId) -> StoreResult<Vec<Gem>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM gems WHERE building_id = ? ORDER BY id")?;
            let ids = stmt
                .query_map([building.0], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        ids.into_iter().map(|id| load_gem(&conn, GemId(id))).collect()
    }

    fn read_gem(&self, id: GemId) -> StoreResult<Gem> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_gem(&conn, id)
    }

    fn commit_build(
        &self,
        placeable: &NewPlaceable,
        task: &Task,
    ) -> StoreResult<(Placeable, Task, Player)> {
        validate_cell(placeable.x, placeable.z).map_err(StoreError::Validation)?;

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        spend_crystals(&tx, task.owner, task.used_crystals)?;

        let (category, kind) = kind_columns(&placeable.kind);
        let (mine_type, last_collected, _) = mine_columns(&placeable.kind);
        tx.execute(
            "INSERT INTO placeables (owner_id, blueprint_id, category, kind, x, z, rotation, level, mine_type, last_collected)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            (
                placeable.owner.0,
                placeable.blueprint_id.0,
                category,
                kind,
                placeable.x,
                placeable.z,
                u8::from(placeable.rotation),
                mine_type,
                last_collected,
            ),
        )?;
        let placeable_id = PlaceableId(tx.last_insert_rowid());

        let task = Task {
            placeable_id,
            ..task.clone()
        };
        insert_task(&tx, &task)?;

        let stored = load_placeable(&tx, placeable_id)?;
        let player = load_player(&tx, task.owner)?;
        tx.commit()?;
        Ok((stored, task, player))
    }

    fn commit_task_start(&self, task: &Task) -> StoreResult<Player> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        spend_crystals(&tx, task.owner, task.used_crystals)?;
        insert_task(&tx, task)?;
        let player = load_player(&tx, task.owner)?;
        tx.commit()?;
        Ok(player)
    }

    fn delete_task(&self, id: TaskId) -> StoreResult<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute("DELETE FROM tasks WHERE id = ?", [id.0.to_string()])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    fn update_task_status(&self, id: TaskId, status: TaskStatus, attempts: u32) -> StoreResult<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE tasks SET status = ?, attempts = ? WHERE id = ?",
            (status.as_str(), attempts, id.0.to_string()),
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    fn load_tasks(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status IN ('pending', 'completing', 'failed') ORDER BY id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn apply_completion(
        &self,
        task: &Task,
        xp_per_level: i64,
        settlement: Option<&MineSettlement>,
    ) -> StoreResult<CompletionOutcome> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let task_id = task.id.0.to_string();

        let seen: i64 = tx.query_row(
            "SELECT COUNT(*) FROM applied_tasks WHERE task_id = ?",
            [&task_id],
            |row| row.get(0),
        )?;
        if seen > 0 {
            return Ok(CompletionOutcome::AlreadyApplied);
        }

        if let Some(settlement) = settlement {
            settle_mine(&tx, task.owner, settlement)?;
        }

        match task.kind {
            TaskKind::Build | TaskKind::Upgrade => {
                let rows = tx.execute(
                    "UPDATE placeables SET level = MAX(level, ?) WHERE id = ? AND owner_id = ?",
                    (task.to_level, task.placeable_id.0, task.owner.0),
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!(
                        "placeable {}",
                        task.placeable_id
                    )));
                }
                let xp = xp_per_level * i64::from(task.to_level);
                tx.execute(
                    "UPDATE players SET xp = xp + ? WHERE id = ?",
                    (xp, task.owner.0),
                )?;
            }
            TaskKind::Mine { yield_amount } => {
                let rows = tx.execute(
                    "UPDATE players SET crystals = crystals + ? WHERE id = ?",
                    (yield_amount, task.owner.0),
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!("player {}", task.owner)));
                }
            }
        }

        tx.execute(
            "INSERT INTO applied_tasks (task_id, applied_at) VALUES (?, ?)",
            (&task_id, format_datetime(Utc::now())),
        )?;
        tx.execute("DELETE FROM tasks WHERE id = ?", [&task_id])?;
        tx.commit()?;

        Ok(CompletionOutcome::Applied)
    }

    fn commit_collect(
        &self,
        owner: PlayerId,
        mine: PlaceableId,
        amount: i64,
        new_origin: DateTime<Utc>,
    ) -> StoreResult<Player> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE placeables SET last_collected = ?, banked = 0
             WHERE id = ? AND owner_id = ? AND kind = 'mine'",
            (format_datetime(new_origin), mine.0, owner.0),
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("mine {} of player {}", mine, owner)));
        }
        tx.execute(
            "UPDATE players SET crystals = crystals + ? WHERE id = ?",
            (amount, owner.0),
        )?;

        let player = load_player(&tx, owner)?;
        tx.commit()?;
        Ok(player)
    }

    fn commit_gem_move(
        &self,
        owner: PlayerId,
        gem: GemId,
        building: Option<PlaceableId>,
        settlements: &[MineSettlement],
    ) -> StoreResult<Gem> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        if let Some(building) = building {
            let category: Option<String> = tx
                .query_row(
                    "SELECT category FROM placeables WHERE id = ? AND owner_id = ?",
                    (building.0, owner.0),
                    |row| row.get(0),
                )
                .optional()?;
            match category.as_deref() {
                Some("building") => {}
                Some(_) => {
                    return Err(StoreError::Validation(format!(
                        "placeable {} is not a building",
                        building
                    )))
                }
                None => return Err(StoreError::NotFound(format!("placeable {}", building))),
            }
        }

        for settlement in settlements {
            settle_mine(&tx, owner, settlement)?;
        }
        let rows = tx.execute(
            "UPDATE gems SET building_id = ? WHERE id = ? AND owner_id = ?",
            (building.map(|b| b.0), gem.0, owner.0),
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("gem {} of player {}", gem, owner)));
        }

        let stored = load_gem(&tx, gem)?;
        tx.commit()?;
        Ok(stored)
    }

    fn commit_battle_outcome(&self, outcome: &BattleOutcome) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let battle_id = outcome.battle_id.0.to_string();

        // A retried commit that already went through is a no-op
        let seen: i64 = tx.query_row(
            "SELECT COUNT(*) FROM battle_outcomes WHERE id = ?",
            [&battle_id],
            |row| row.get(0),
        )?;
        if seen > 0 {
            return Ok(());
        }

        let ids: Vec<i64> = outcome.participants.iter().map(|p| p.player_id.0).collect();
        let mut gems_won = 0_i64;

        for p in &outcome.participants {
            let won = p.result == MatchResult::Won;
            let rows = tx.execute(
                "UPDATE players SET xp = xp + ?, crystals = crystals + ?, mana = ?, mana_updated_at = ?
                 WHERE id = ?",
                (
                    p.xp_awarded,
                    p.crystals_awarded,
                    p.mana_after.clamp(0, MANA_CAP),
                    format_datetime(outcome.ended_at),
                    p.player_id.0,
                ),
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("player {}", p.player_id)));
            }

            let gems_lost = match outcome.winner {
                Some(winner) if winner != p.player_id => tx.execute(
                    "UPDATE gems SET owner_id = ?, building_id = NULL, staked = 0
                     WHERE owner_id = ? AND staked = 1",
                    (winner.0, p.player_id.0),
                )? as i64,
                _ => 0,
            };
            gems_won += gems_lost;

            tx.execute(
                "INSERT INTO player_stats (player_id) VALUES (?) ON CONFLICT (player_id) DO NOTHING",
                [p.player_id.0],
            )?;
            tx.execute(
                "UPDATE player_stats SET
                    games_played = games_played + 1,
                    games_won = games_won + ?,
                    damage_dealt = damage_dealt + ?,
                    damage_taken = damage_taken + ?,
                    mana_spent = mana_spent + ?,
                    spell_casts = spell_casts + ?,
                    gems_lost = gems_lost + ?
                 WHERE player_id = ?",
                (
                    won as i64,
                    p.damage_dealt,
                    p.damage_taken,
                    p.mana_spent,
                    p.spell_casts,
                    gems_lost,
                    p.player_id.0,
                ),
            )?;
        }

        if let Some(winner) = outcome.winner {
            tx.execute(
                "UPDATE player_stats SET gems_won = gems_won + ? WHERE player_id = ?",
                (gems_won, winner.0),
            )?;
        }

        // Whatever is still staked (the winner's own stake, or everything on a
        // draw) goes back to its owner
        for id in &ids {
            tx.execute(
                "UPDATE gems SET staked = 0 WHERE owner_id = ? AND staked = 1",
                [id],
            )?;
        }

        let participants = serde_json::to_string(&outcome.participants)
            .map_err(|e| StoreError::Validation(format!("unserializable participants: {}", e)))?;
        tx.execute(
            "INSERT INTO battle_outcomes (id, winner_id, reason, started_at, ended_at, participants)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                &battle_id,
                outcome.winner.map(|w| w.0),
                outcome.reason.as_str(),
                format_datetime(outcome.started_at),
                format_datetime(outcome.ended_at),
                participants,
            ),
        )?;

        tx.commit()?;
        Ok(())
    }

    fn save_chat_message(&self, message: &NewChatMessage) -> StoreResult<ChatMessage> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "INSERT INTO chat_messages (player_id, message, created_at) VALUES (?, ?, ?)",
            (
                message.sender.0,
                &message.message,
                format_datetime(message.sent_at),
            ),
        )?;
        Ok(ChatMessage {
            id: conn.last_insert_rowid(),
            sender: message.sender,
            message: message.message.clone(),
            sent_at: message.sent_at,
        })
    }
}

impl IdentityResolver for Database {
    fn resolve(&self, token: &str, now: DateTime<Utc>) -> StoreResult<Option<PlayerId>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let session = conn
            .query_row(
                "SELECT player_id, expires_at FROM player_sessions WHERE token = ?",
                [token],
                |row| Ok((PlayerId(row.get(0)?), parse_datetime(row, 1)?)),
            )
            .optional()?;
        Ok(session.and_then(|(player, expires_at)| (now < expires_at).then_some(player)))
    }
}

// ============================================================
// Row helpers
// ============================================================

fn load_player(conn: &Connection, id: PlayerId) -> StoreResult<Player> {
    conn.query_row(
        "SELECT id, crystals, xp, mana, mana_updated_at FROM players WHERE id = ?",
        [id.0],
        |row| {
            Ok(Player {
                id: PlayerId(row.get(0)?),
                crystals: row.get(1)?,
                xp: row.get(2)?,
                mana: row.get(3)?,
                mana_updated_at: parse_datetime(row, 4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("player {}", id)))
}

fn load_placeable(conn: &Connection, id: PlaceableId) -> StoreResult<Placeable> {
    conn.query_row(
        &format!("SELECT {} FROM placeables WHERE id = ?", PLACEABLE_COLUMNS),
        [id.0],
        placeable_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("placeable {}", id)))
}

fn load_gem(conn: &Connection, id: GemId) -> StoreResult<Gem> {
    let (owner, building_id, staked) = conn
        .query_row(
            "SELECT owner_id, building_id, staked FROM gems WHERE id = ?",
            [id.0],
            |row| {
                Ok((
                    PlayerId(row.get(0)?),
                    row.get::<_, Option<i64>>(1)?.map(PlaceableId),
                    row.get::<_, i64>(2)? != 0,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("gem {}", id)))?;

    let mut stmt = conn.prepare(
        "SELECT v.attribute_id, a.name, v.multiplier
         FROM gem_attribute_values v JOIN gem_attributes a ON a.id = v.attribute_id
         WHERE v.gem_id = ? ORDER BY v.attribute_id",
    )?;
    let attributes = stmt
        .query_map([id.0], |row| {
            Ok(GemAttribute {
                attribute_id: row.get(0)?,
                name: row.get(1)?,
                multiplier: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Gem {
        id,
        owner,
        building_id,
        staked,
        attributes,
    })
}

/// Take `amount` crystals from `owner`, relative to the stored balance.
fn spend_crystals(tx: &Transaction<'_>, owner: PlayerId, amount: i64) -> StoreResult<()> {
    if amount < 0 {
        return Err(StoreError::Validation(format!("cost must be >= 0, got {}", amount)));
    }
    let rows = tx.execute(
        "UPDATE players SET crystals = crystals - ? WHERE id = ? AND crystals >= ?",
        (amount, owner.0, amount),
    )?;
    if rows == 0 {
        let player = load_player(tx, owner)?;
        return Err(StoreError::Validation(format!(
            "not enough crystals: need {}, have {}",
            amount, player.crystals
        )));
    }
    Ok(())
}

fn settle_mine(tx: &Transaction<'_>, owner: PlayerId, settlement: &MineSettlement) -> StoreResult<()> {
    let rows = tx.execute(
        "UPDATE placeables SET banked = ?, last_collected = ?
         WHERE id = ? AND owner_id = ? AND kind = 'mine'",
        (
            settlement.banked,
            format_datetime(settlement.last_collected),
            settlement.placeable_id.0,
            owner.0,
        ),
    )?;
    if rows == 0 {
        return Err(StoreError::NotFound(format!(
            "mine {} of player {}",
            settlement.placeable_id, owner
        )));
    }
    Ok(())
}

fn insert_task(tx: &Transaction<'_>, task: &Task) -> StoreResult<()> {
    let yield_amount = match task.kind {
        TaskKind::Mine { yield_amount } => yield_amount,
        _ => 0,
    };
    tx.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TASK_COLUMNS
        ),
        (
            task.id.0.to_string(),
            task.owner.0,
            task.placeable_id.0,
            task.kind.as_str(),
            yield_amount,
            task.used_crystals,
            task.to_level,
            format_datetime(task.started_at),
            task.duration_secs,
            task.status.as_str(),
            task.attempts,
        ),
    )?;
    Ok(())
}

fn blueprint_from_row(row: &Row<'_>) -> rusqlite::Result<Blueprint> {
    let kind: String = row.get(3)?;
    Ok(Blueprint {
        id: BlueprintId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        kind: BlueprintKind::from_str(&kind).ok_or_else(|| invalid_column(3, "blueprint kind", &kind))?,
        cost: row.get(4)?,
        buildtime_secs: row.get(5)?,
    })
}

fn placeable_from_row(row: &Row<'_>) -> rusqlite::Result<Placeable> {
    let kind_str: String = row.get(4)?;
    let blueprint_kind = BlueprintKind::from_str(&kind_str)
        .ok_or_else(|| invalid_column(4, "placeable kind", &kind_str))?;

    let kind = match PlaceableKind::for_blueprint(blueprint_kind, DateTime::<Utc>::UNIX_EPOCH) {
        PlaceableKind::Building(BuildingKind::Mine(_)) => {
            let mine_type: Option<String> = row.get(9)?;
            let mine_type = match mine_type.as_deref() {
                None => MineType::Crystal,
                Some(s) => MineType::from_str(s).ok_or_else(|| invalid_column(9, "mine type", s))?,
            };
            let last_collected = match row.get::<_, Option<String>>(10)? {
                Some(_) => parse_datetime(row, 10)?,
                None => DateTime::<Utc>::UNIX_EPOCH,
            };
            PlaceableKind::Building(BuildingKind::Mine(MineState {
                mine_type,
                last_collected,
                banked: row.get(11)?,
            }))
        }
        other => other,
    };

    let rotation: u8 = row.get(7)?;
    Ok(Placeable {
        id: PlaceableId(row.get(0)?),
        owner: PlayerId(row.get(1)?),
        blueprint_id: BlueprintId(row.get(2)?),
        x: row.get(5)?,
        z: row.get(6)?,
        rotation: Rotation::try_from(rotation)
            .map_err(|_| invalid_column(7, "rotation", &rotation.to_string()))?,
        level: row.get(8)?,
        kind,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let kind: String = row.get(3)?;
    let status: String = row.get(9)?;

    let kind = match kind.as_str() {
        "build" => TaskKind::Build,
        "upgrade" => TaskKind::Upgrade,
        "mine" => TaskKind::Mine {
            yield_amount: row.get(4)?,
        },
        other => return Err(invalid_column(3, "task kind", other)),
    };

    Ok(Task {
        id: TaskId(Uuid::parse_str(&id).map_err(|_| invalid_column(0, "task id", &id))?),
        owner: PlayerId(row.get(1)?),
        placeable_id: PlaceableId(row.get(2)?),
        kind,
        used_crystals: row.get(5)?,
        to_level: row.get(6)?,
        started_at: parse_datetime(row, 7)?,
        duration_secs: row.get(8)?,
        status: TaskStatus::from_str(&status)
            .ok_or_else(|| invalid_column(9, "task status", &status))?,
        attempts: row.get(10)?,
    })
}

fn kind_columns(kind: &PlaceableKind) -> (&'static str, &'static str) {
    match kind {
        PlaceableKind::Entity(EntityKind::Bush) => ("entity", "bush"),
        PlaceableKind::Entity(EntityKind::Tree) => ("entity", "tree"),
        PlaceableKind::Building(b) => (
            "building",
            match b {
                BuildingKind::Altar => "altar",
                BuildingKind::Mine(_) => "mine",
                BuildingKind::Tower => "tower",
                BuildingKind::FuseTable => "fuse_table",
                BuildingKind::WarriorHut => "warrior_hut",
                BuildingKind::Wall => "wall",
            },
        ),
    }
}

fn mine_columns(kind: &PlaceableKind) -> (Option<&'static str>, Option<String>, i64) {
    match kind {
        PlaceableKind::Building(BuildingKind::Mine(state)) => (
            Some(state.mine_type.as_str()),
            Some(format_datetime(state.last_collected)),
            state.banked,
        ),
        _ => (None, None, 0),
    }
}

fn chat_message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        sender: PlayerId(row.get(1)?),
        message: row.get(2)?,
        sent_at: parse_datetime(row, 3)?,
    })
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn invalid_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid {}: {}", what, value).into(),
    )
}
