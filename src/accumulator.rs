//! Resource Accumulator.
//!
//! Mana regeneration and passive mine output are never stored as running
//! totals. Both are derived on read from a rate, an origin timestamp and the
//! current instant, so idle islands cost nothing between visits.
//!
//! Mine output is quantized: a mine produces one crystal per production
//! period. Collecting moves the origin forward by exactly the production time
//! of the collected crystals, which makes repeated collections over an
//! interval add up to a single collection at its end.
//!
//! A mine's rate changes when its level or its gems change. Right before that
//! happens the window is settled: what it produced so far is banked on the
//! mine at the old rate and the origin moves up, so the new rate only ever
//! applies to time after the change.

use chrono::{DateTime, Duration, Utc};

use crate::config::ProgressionConfig;
use crate::models::*;

#[derive(Debug, Clone)]
pub struct ResourceAccumulator {
    config: ProgressionConfig,
}

/// Result of collecting a mine at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub amount: i64,
    /// The mine's accumulation origin after the collection.
    pub new_origin: DateTime<Utc>,
}

impl ResourceAccumulator {
    pub fn new(config: ProgressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProgressionConfig {
        &self.config
    }

    /// Mana of `player` at `now`, capped at [`MANA_CAP`].
    pub fn mana_at(&self, player: &Player, now: DateTime<Utc>) -> i64 {
        let elapsed = (now - player.mana_updated_at).num_seconds().max(0);
        let regen = self.config.mana_regen_per_sec.saturating_mul(elapsed);
        player.mana.saturating_add(regen).clamp(0, MANA_CAP)
    }

    /// Fold regeneration into the stored balance so a spend can be applied.
    pub fn settle_mana(&self, player: &mut Player, now: DateTime<Utc>) {
        if now <= player.mana_updated_at {
            return;
        }
        player.mana = self.mana_at(player, now);
        player.mana_updated_at = now;
    }

    /// Time a mine needs to produce one crystal, or `None` if it produces
    /// nothing (level 0 or a zero gem multiplier).
    pub fn production_period(&self, level: i32, gem_multiplier: f64) -> Option<Duration> {
        let rate = f64::from(level) * gem_multiplier;
        if rate <= 0.0 || !rate.is_finite() {
            return None;
        }
        let millis = (self.config.mine_period_secs as f64 * 1000.0 / rate).round() as i64;
        Some(Duration::milliseconds(millis.max(1)))
    }

    pub fn mine_capacity(&self, level: i32) -> i64 {
        self.config
            .mine_capacity_per_level
            .saturating_mul(i64::from(level.max(0)))
    }

    /// Crystals waiting in `mine` at `now`: its banked amount plus what it
    /// produced since its origin, up to its capacity. Returns 0 for anything
    /// that is not a mine.
    pub fn mine_yield_since(&self, mine: &Placeable, gems: &[Gem], now: DateTime<Utc>) -> i64 {
        let Some(state) = mine.mine() else {
            return 0;
        };
        let produced = match self.production_period(mine.level, combined_multiplier(gems)) {
            Some(period) => {
                let elapsed = (now - state.last_collected).num_milliseconds().max(0);
                elapsed / period.num_milliseconds()
            }
            None => 0,
        };
        state
            .banked
            .saturating_add(produced)
            .min(self.mine_capacity(mine.level))
    }

    /// What collecting `mine` at `now` yields and where its origin moves.
    pub fn collect(&self, mine: &Placeable, gems: &[Gem], now: DateTime<Utc>) -> Option<Collection> {
        let state = mine.mine()?;
        let amount = self.mine_yield_since(mine, gems, now);
        // only crystals of the current window move the origin
        let produced = amount - state.banked.clamp(0, amount);

        let new_origin = match self.production_period(mine.level, combined_multiplier(gems)) {
            Some(period) if amount < self.mine_capacity(mine.level) => {
                let advance = period.num_milliseconds().saturating_mul(produced);
                state
                    .last_collected
                    .checked_add_signed(Duration::milliseconds(advance))
                    .unwrap_or(now)
            }
            // A full mine stopped producing; idle time is not carried over.
            _ => now,
        };

        Some(Collection {
            amount,
            new_origin: new_origin.min(now),
        })
    }

    /// Bank what `mine` produced up to `at` at its current rate and move its
    /// origin there. Must be taken right before the mine's level or gems
    /// change. Returns `None` for anything that is not a mine.
    pub fn settle(&self, mine: &Placeable, gems: &[Gem], at: DateTime<Utc>) -> Option<MineSettlement> {
        let state = mine.mine()?;
        let at = at.max(state.last_collected);
        let collection = self.collect(mine, gems, at)?;
        Some(MineSettlement {
            placeable_id: mine.id,
            banked: collection.amount,
            last_collected: collection.new_origin,
        })
    }

    /// Lump yield of a deep-dig mine task.
    pub fn mine_task_yield(&self, level: i32, gems: &[Gem]) -> i64 {
        let base = self
            .config
            .mine_task_yield_per_level
            .saturating_mul(i64::from(level.max(0)));
        (base as f64 * combined_multiplier(gems)).floor() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn accumulator() -> ResourceAccumulator {
        ResourceAccumulator::new(ProgressionConfig::default())
    }

    fn player(mana: i64) -> Player {
        Player {
            id: PlayerId(1),
            crystals: 0,
            xp: 0,
            mana,
            mana_updated_at: t(0),
        }
    }

    fn mine(level: i32) -> Placeable {
        Placeable {
            id: PlaceableId(1),
            owner: PlayerId(1),
            blueprint_id: BlueprintId(2),
            x: 0,
            z: 0,
            rotation: Rotation::North,
            level,
            kind: PlaceableKind::for_blueprint(BlueprintKind::Mine, t(0)),
        }
    }

    fn settled(mut mine: Placeable, settlement: MineSettlement, level: i32) -> Placeable {
        let state = mine.mine_mut().unwrap();
        state.banked = settlement.banked;
        state.last_collected = settlement.last_collected;
        mine.level = level;
        mine
    }

    fn gem(multiplier: f64) -> Gem {
        Gem {
            id: GemId(1),
            owner: PlayerId(1),
            building_id: Some(PlaceableId(1)),
            staked: false,
            attributes: vec![GemAttribute {
                attribute_id: 1,
                name: "yield".to_string(),
                multiplier,
            }],
        }
    }

    #[test]
    fn mana_regenerates_up_to_cap() {
        let acc = ResourceAccumulator::new(ProgressionConfig {
            mana_regen_per_sec: 2,
            ..Default::default()
        });
        let p = player(990);
        assert_eq!(acc.mana_at(&p, t(0)), 990);
        assert_eq!(acc.mana_at(&p, t(4)), 998);
        assert_eq!(acc.mana_at(&p, t(10)), 1000);
        assert_eq!(acc.mana_at(&p, t(10_000)), 1000);
    }

    #[test]
    fn mana_is_monotonic_between_spends() {
        let acc = accumulator();
        let p = player(0);
        let mut last = 0;
        for secs in 0..1200 {
            let mana = acc.mana_at(&p, t(secs));
            assert!(mana >= last);
            assert!(mana <= MANA_CAP);
            last = mana;
        }
    }

    #[test]
    fn settle_folds_regen_into_balance() {
        let acc = accumulator();
        let mut p = player(100);
        acc.settle_mana(&mut p, t(50));
        assert_eq!(p.mana, 150);
        assert_eq!(p.mana_updated_at, t(50));
        assert_eq!(acc.mana_at(&p, t(60)), 160);
    }

    #[test]
    fn mine_yield_scales_with_level_and_gems() {
        let acc = accumulator();
        assert_eq!(acc.mine_yield_since(&mine(1), &[], t(600)), 10);
        assert_eq!(acc.mine_yield_since(&mine(2), &[], t(600)), 20);
        assert_eq!(acc.mine_yield_since(&mine(1), &[gem(1.5)], t(600)), 15);
        assert_eq!(acc.mine_yield_since(&mine(1), &[gem(0.0)], t(600)), 0);
        assert_eq!(acc.mine_yield_since(&mine(0), &[], t(600)), 0);
    }

    #[test]
    fn mine_yield_is_capped_by_level() {
        let acc = accumulator();
        assert_eq!(acc.mine_yield_since(&mine(1), &[], t(60 * 10_000)), 500);
    }

    #[test]
    fn collections_are_additive() {
        let acc = accumulator();
        let once = acc.collect(&mine(1), &[], t(250)).unwrap();

        let mut m = mine(1);
        let mut total = 0;
        for at in [70, 130, 190, 250] {
            let c = acc.collect(&m, &[], t(at)).unwrap();
            total += c.amount;
            m.mine_mut().unwrap().last_collected = c.new_origin;
        }

        assert_eq!(once.amount, 4);
        assert_eq!(total, once.amount);
        assert_eq!(m.mine().unwrap().last_collected, t(240));
    }

    #[test]
    fn full_mine_resets_origin() {
        let acc = accumulator();
        let c = acc.collect(&mine(1), &[], t(60 * 1000)).unwrap();
        assert_eq!(c.amount, 500);
        assert_eq!(c.new_origin, t(60 * 1000));
    }

    #[test]
    fn collect_ignores_non_mines() {
        let acc = accumulator();
        let mut tower = mine(1);
        tower.kind = PlaceableKind::Building(BuildingKind::Tower);
        assert!(acc.collect(&tower, &[], t(600)).is_none());
        assert_eq!(acc.mine_yield_since(&tower, &[], t(600)), 0);
    }

    #[test]
    fn mine_task_yield() {
        let acc = accumulator();
        assert_eq!(acc.mine_task_yield(3, &[]), 150);
        assert_eq!(acc.mine_task_yield(2, &[gem(1.5)]), 150);
    }

    #[test]
    fn settling_keeps_earlier_output_at_the_old_rate() {
        let acc = accumulator();
        // level 1 until 630s, level 2 afterwards
        let settlement = acc.settle(&mine(1), &[], t(630)).unwrap();
        assert_eq!(settlement.banked, 10);
        assert_eq!(settlement.last_collected, t(600));

        let upgraded = settled(mine(1), settlement, 2);
        assert_eq!(acc.mine_yield_since(&upgraded, &[], t(630)), 11);

        let c = acc.collect(&upgraded, &[], t(1230)).unwrap();
        // 10 banked, then 630s at 30s per crystal
        assert_eq!(c.amount, 31);
        assert_eq!(c.new_origin, t(1230));
    }

    #[test]
    fn settling_an_unbuilt_mine_starts_its_window() {
        let acc = accumulator();
        let settlement = acc.settle(&mine(0), &[], t(30)).unwrap();
        assert_eq!(settlement.banked, 0);
        assert_eq!(settlement.last_collected, t(30));
    }

    #[test]
    fn settling_before_the_origin_changes_nothing() {
        let acc = accumulator();
        let mut m = mine(1);
        m.mine_mut().unwrap().last_collected = t(100);

        let settlement = acc.settle(&m, &[], t(50)).unwrap();
        assert_eq!(settlement.banked, 0);
        assert_eq!(settlement.last_collected, t(100));
    }

    #[test]
    fn banked_output_respects_capacity() {
        let acc = accumulator();
        let mut m = mine(1);
        m.mine_mut().unwrap().banked = 495;
        assert_eq!(acc.mine_yield_since(&m, &[], t(60 * 100)), 500);

        let c = acc.collect(&m, &[], t(60 * 100)).unwrap();
        assert_eq!(c.amount, 500);
        assert_eq!(c.new_origin, t(60 * 100));
    }

    #[test]
    fn long_windows_do_not_truncate_the_origin() {
        let acc = ResourceAccumulator::new(ProgressionConfig {
            mine_period_secs: 0,
            mine_capacity_per_level: i64::MAX,
            ..Default::default()
        });
        // one crystal per millisecond for 35 days is more than i32 can count
        let at = t(3_000_000);
        let c = acc.collect(&mine(1), &[], at).unwrap();
        assert_eq!(c.amount, 3_000_000_000);
        assert!(c.amount > i64::from(i32::MAX));
        assert_eq!(c.new_origin, at);
    }
}
