use chrono::Duration;

use crate::{
    config::EngineConfig,
    rules::{PirSettings, RelayRules, RuleSet},
    types::{RelayBank, RelayId, RelayRecord, Timestamp, Transition, RELAY_COUNT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCause {
    Manual,
    Motion,
    MotionTimeout,
    ScheduleOn,
    ScheduleOff,
    AutoOff,
    AutoOn,
}

impl ActionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Motion => "MOTION",
            Self::MotionTimeout => "MOTION_TIMEOUT",
            Self::ScheduleOn => "SCHEDULE_ON",
            Self::ScheduleOff => "SCHEDULE_OFF",
            Self::AutoOff => "AUTO_OFF",
            Self::AutoOn => "AUTO_ON",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayAction {
    pub relay: RelayId,
    pub cause: ActionCause,
    pub transition: Transition,
}

impl RelayAction {
    fn new(relay: RelayId, cause: ActionCause, transition: Transition) -> Self {
        Self {
            relay,
            cause,
            transition,
        }
    }

    pub fn is_on(&self) -> bool {
        self.transition.on
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MotionState {
    present: bool,
    last_seen: Option<Timestamp>,
    last_detected: Option<Timestamp>,
}

/// Tick bookkeeping captured before a tick, so a tick whose transitions
/// could not be persisted can be replayed.
#[derive(Debug, Clone, Copy)]
pub struct TickCheckpoint {
    last_tick: Option<Timestamp>,
    motion_owned: [bool; RELAY_COUNT as usize],
}

#[derive(Debug, Clone)]
pub struct RelayEngine {
    pub config: EngineConfig,
    rules: RuleSet,
    motion: MotionState,

    // Relays switched on by motion; these go off again once the hold lapses.
    motion_owned: [bool; RELAY_COUNT as usize],
    manual_at: [Option<Timestamp>; RELAY_COUNT as usize],

    last_tick: Option<Timestamp>,
}

impl RelayEngine {
    pub fn new(config: EngineConfig, rules: RuleSet) -> Self {
        Self {
            config,
            rules,
            motion: MotionState::default(),
            motion_owned: [false; RELAY_COUNT as usize],
            manual_at: [None; RELAY_COUNT as usize],
            last_tick: None,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn set_rules(&mut self, id: RelayId, rules: RelayRules) -> bool {
        let mut candidate = self.rules.clone();
        candidate.set(id, rules);
        self.replace_rules(candidate)
    }

    pub fn set_pir_settings(&mut self, mut settings: PirSettings) -> bool {
        settings.sanitize();
        let mut candidate = self.rules.clone();
        candidate.pir = settings;
        self.replace_rules(candidate)
    }

    pub fn replace_rules(&mut self, rules: RuleSet) -> bool {
        if self.rules == rules {
            return false;
        }
        self.rules = rules;
        true
    }

    /// Records a PIR reading. `present` is the current line level; the hold
    /// period counts from the latest reading once the line drops.
    pub fn record_motion(&mut self, present: bool, now: Timestamp) {
        self.motion.present = present;
        self.motion.last_seen = Some(now);
        if present {
            self.motion.last_detected = Some(now);
        }
    }

    pub fn last_motion(&self) -> Option<Timestamp> {
        self.motion.last_seen
    }

    pub fn motion_active(&self, now: Timestamp) -> bool {
        self.motion.present || self.motion_remaining_secs(now) > 0
    }

    pub fn motion_remaining_secs(&self, now: Timestamp) -> u64 {
        let hold = self.rules.pir.hold_secs;
        if self.motion.present {
            return hold;
        }
        if self.motion.last_detected.is_none() {
            return 0;
        }
        self.motion
            .last_seen
            .and_then(|seen| elapsed_secs(seen, now))
            .map(|elapsed| hold.saturating_sub(elapsed))
            .unwrap_or(0)
    }

    /// Evaluates every relay's rules at `now` and applies the resulting
    /// transitions to `bank`.
    pub fn tick(&mut self, bank: &mut RelayBank, now: Timestamp) -> Vec<RelayAction> {
        let previous = self.last_tick.replace(now);
        let catchup = Duration::seconds(self.config.schedule_catchup_secs.min(86_400) as i64);
        let window_start = previous.map(|previous| previous.max(now - catchup));

        RelayId::all()
            .filter_map(|id| self.evaluate(id, bank.get_mut(id), window_start, now))
            .collect()
    }

    pub fn checkpoint(&self) -> TickCheckpoint {
        TickCheckpoint {
            last_tick: self.last_tick,
            motion_owned: self.motion_owned,
        }
    }

    /// Rewinds to `checkpoint` so the next tick sees the same schedule
    /// window and motion ownership again.
    pub fn restore(&mut self, checkpoint: TickCheckpoint) {
        self.last_tick = checkpoint.last_tick;
        self.motion_owned = checkpoint.motion_owned;
    }

    pub fn manual_switch(
        &mut self,
        bank: &mut RelayBank,
        id: RelayId,
        on: bool,
        now: Timestamp,
    ) -> Option<RelayAction> {
        self.motion_owned[id.slot()] = false;
        self.manual_at[id.slot()] = Some(now);
        bank.get_mut(id)
            .switch(on, now)
            .map(|transition| RelayAction::new(id, ActionCause::Manual, transition))
    }

    fn evaluate(
        &mut self,
        id: RelayId,
        record: &mut RelayRecord,
        window_start: Option<Timestamp>,
        now: Timestamp,
    ) -> Option<RelayAction> {
        let slot = id.slot();
        let rules = self.rules.get(id).clone();

        if rules.manual_override {
            return None;
        }

        if self.rules.pir.controls(id) {
            if self.motion_triggers(id, now) {
                let transition = record.switch(true, now)?;
                self.motion_owned[slot] = true;
                return Some(RelayAction::new(id, ActionCause::Motion, transition));
            }

            if self.motion_owned[slot] {
                self.motion_owned[slot] = false;
                return record
                    .switch(false, now)
                    .map(|transition| RelayAction::new(id, ActionCause::MotionTimeout, transition));
            }
        } else {
            self.motion_owned[slot] = false;
        }

        if let Some(on) = rules.schedule.edge_between(window_start, now) {
            let cause = if on {
                ActionCause::ScheduleOn
            } else {
                ActionCause::ScheduleOff
            };
            if let Some(transition) = record.switch(on, now) {
                return Some(RelayAction::new(id, cause, transition));
            }
        }

        if record.status {
            let limit = rules.auto_off_after_secs?;
            let elapsed = record.last_on.and_then(|on| elapsed_secs(on, now))?;
            if elapsed >= limit {
                return record
                    .switch(false, now)
                    .map(|transition| RelayAction::new(id, ActionCause::AutoOff, transition));
            }
        } else {
            let limit = rules.auto_on_after_secs?;
            let elapsed = record.last_off.and_then(|off| elapsed_secs(off, now))?;
            let window_end = limit.saturating_add(self.config.auto_on_grace_secs);
            if (limit..window_end).contains(&elapsed) {
                return record
                    .switch(true, now)
                    .map(|transition| RelayAction::new(id, ActionCause::AutoOn, transition));
            }
        }

        None
    }

    fn motion_triggers(&self, id: RelayId, now: Timestamp) -> bool {
        if !self.motion_active(now) {
            return false;
        }
        // A manual switch wins until the sensor detects motion again.
        match self.manual_at[id.slot()] {
            Some(manual) => self
                .motion
                .last_detected
                .is_some_and(|detected| detected > manual),
            None => true,
        }
    }
}

fn elapsed_secs(since: Timestamp, now: Timestamp) -> Option<u64> {
    u64::try_from((now - since).num_seconds()).ok()
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schedule::DailySchedule;

    fn ist(hour: u32, minute: u32, second: u32) -> Timestamp {
        FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 5, hour, minute, second)
            .unwrap()
    }

    fn relay(number: u8) -> RelayId {
        RelayId::new(number).unwrap()
    }

    fn engine_with(id: RelayId, rules: RelayRules) -> RelayEngine {
        let mut set = RuleSet::default();
        set.set(id, rules);
        RelayEngine::new(EngineConfig::default(), set)
    }

    fn with_pir(mut engine: RelayEngine, id: RelayId) -> RelayEngine {
        engine.set_pir_settings(PirSettings {
            enabled: true,
            relays: vec![id],
            hold_secs: 120,
        });
        engine
    }

    fn causes(actions: &[RelayAction]) -> Vec<(RelayId, ActionCause)> {
        actions
            .iter()
            .map(|action| (action.relay, action.cause))
            .collect()
    }

    #[test]
    fn auto_off_after_elapsed_duration() {
        let id = relay(1);
        let mut engine = engine_with(
            id,
            RelayRules {
                auto_off_after_secs: Some(600),
                ..RelayRules::default()
            },
        );
        let mut bank = RelayBank::default();
        bank.get_mut(id).switch(true, ist(8, 0, 0));

        assert!(engine.tick(&mut bank, ist(8, 9, 59)).is_empty());

        let actions = engine.tick(&mut bank, ist(8, 10, 0));
        assert_eq!(causes(&actions), vec![(id, ActionCause::AutoOff)]);
        assert_eq!(actions[0].transition.accrued_secs, 600);
        assert_eq!(bank.get(id).total_on_time, 600);
        assert!(!bank.get(id).status);
    }

    #[test]
    fn auto_on_fires_inside_grace_window() {
        let id = relay(2);
        let mut engine = engine_with(
            id,
            RelayRules {
                auto_on_after_secs: Some(60),
                ..RelayRules::default()
            },
        );
        let mut bank = RelayBank::default();
        bank.get_mut(id).last_off = Some(ist(8, 0, 0));

        let actions = engine.tick(&mut bank, ist(8, 1, 0));
        assert_eq!(causes(&actions), vec![(id, ActionCause::AutoOn)]);
        assert_eq!(bank.get(id).last_on, Some(ist(8, 1, 0)));
    }

    #[test]
    fn auto_on_ignores_stale_last_off() {
        let id = relay(2);
        let mut engine = engine_with(
            id,
            RelayRules {
                auto_on_after_secs: Some(60),
                ..RelayRules::default()
            },
        );
        let mut bank = RelayBank::default();
        bank.get_mut(id).last_off = Some(ist(8, 0, 0));

        assert!(engine.tick(&mut bank, ist(9, 0, 0)).is_empty());
        assert!(!bank.get(id).status);
    }

    #[test]
    fn missing_timestamps_skip_timers() {
        let mut engine = engine_with(
            relay(1),
            RelayRules {
                auto_off_after_secs: Some(1),
                ..RelayRules::default()
            },
        );
        engine.set_rules(
            relay(2),
            RelayRules {
                auto_on_after_secs: Some(1),
                ..RelayRules::default()
            },
        );
        let mut bank = RelayBank::default();
        bank.get_mut(relay(1)).status = true;

        assert!(engine.tick(&mut bank, ist(8, 0, 0)).is_empty());
        assert!(bank.get(relay(1)).status);
        assert!(!bank.get(relay(2)).status);
    }

    #[test]
    fn manual_override_suspends_automation() {
        let id = relay(1);
        let mut engine = with_pir(
            engine_with(
                id,
                RelayRules {
                    auto_off_after_secs: Some(5),
                    manual_override: true,
                    ..RelayRules::default()
                },
            ),
            id,
        );
        let mut bank = RelayBank::default();
        engine.record_motion(true, ist(8, 0, 0));

        assert!(engine.tick(&mut bank, ist(8, 0, 1)).is_empty());
        assert!(!bank.get(id).status);

        bank.get_mut(id).switch(true, ist(8, 0, 2));
        assert!(engine.tick(&mut bank, ist(8, 5, 0)).is_empty());
        assert!(bank.get(id).status);
    }

    #[test]
    fn motion_switches_on_and_releases_after_hold() {
        let id = relay(1);
        let mut engine = with_pir(engine_with(id, RelayRules::default()), id);
        let mut bank = RelayBank::default();

        engine.record_motion(true, ist(8, 0, 0));
        let actions = engine.tick(&mut bank, ist(8, 0, 1));
        assert_eq!(causes(&actions), vec![(id, ActionCause::Motion)]);

        engine.record_motion(false, ist(8, 0, 30));
        assert!(engine.tick(&mut bank, ist(8, 2, 0)).is_empty());
        assert!(bank.get(id).status);

        let actions = engine.tick(&mut bank, ist(8, 2, 31));
        assert_eq!(causes(&actions), vec![(id, ActionCause::MotionTimeout)]);
        assert_eq!(bank.get(id).total_on_time, 150);
    }

    #[test]
    fn motion_leaves_relays_it_did_not_switch_on() {
        let id = relay(1);
        let mut engine = with_pir(engine_with(id, RelayRules::default()), id);
        let mut bank = RelayBank::default();
        bank.get_mut(id).switch(true, ist(7, 0, 0));

        engine.record_motion(true, ist(8, 0, 0));
        assert!(engine.tick(&mut bank, ist(8, 0, 1)).is_empty());
        engine.record_motion(false, ist(8, 0, 5));

        assert!(engine.tick(&mut bank, ist(8, 30, 0)).is_empty());
        assert!(bank.get(id).status);
    }

    #[test]
    fn manual_switch_wins_until_next_motion() {
        let id = relay(1);
        let mut engine = with_pir(engine_with(id, RelayRules::default()), id);
        let mut bank = RelayBank::default();

        engine.record_motion(true, ist(8, 0, 0));
        engine.tick(&mut bank, ist(8, 0, 1));
        assert!(bank.get(id).status);

        let action = engine.manual_switch(&mut bank, id, false, ist(8, 0, 10)).unwrap();
        assert_eq!(action.cause, ActionCause::Manual);
        assert!(engine.tick(&mut bank, ist(8, 0, 11)).is_empty());
        assert!(!bank.get(id).status);

        engine.record_motion(true, ist(8, 0, 20));
        let actions = engine.tick(&mut bank, ist(8, 0, 21));
        assert_eq!(causes(&actions), vec![(id, ActionCause::Motion)]);
    }

    #[test]
    fn clear_reading_does_not_undo_manual_off() {
        let id = relay(1);
        let mut engine = with_pir(engine_with(id, RelayRules::default()), id);
        let mut bank = RelayBank::default();

        engine.record_motion(true, ist(8, 0, 0));
        engine.tick(&mut bank, ist(8, 0, 1));
        engine.manual_switch(&mut bank, id, false, ist(8, 0, 10));

        engine.record_motion(false, ist(8, 0, 30));
        assert!(engine.tick(&mut bank, ist(8, 0, 31)).is_empty());
        assert!(!bank.get(id).status);
    }

    #[test]
    fn clear_reading_alone_is_not_motion() {
        let id = relay(1);
        let mut engine = with_pir(engine_with(id, RelayRules::default()), id);
        let mut bank = RelayBank::default();

        engine.record_motion(false, ist(8, 0, 0));
        assert!(!engine.motion_active(ist(8, 0, 1)));
        assert!(engine.tick(&mut bank, ist(8, 0, 1)).is_empty());
    }

    #[test]
    fn motion_holds_relay_against_auto_off() {
        let id = relay(3);
        let mut engine = with_pir(
            engine_with(
                id,
                RelayRules {
                    auto_off_after_secs: Some(60),
                    ..RelayRules::default()
                },
            ),
            id,
        );
        let mut bank = RelayBank::default();
        bank.get_mut(id).switch(true, ist(8, 0, 0));

        engine.record_motion(true, ist(8, 5, 0));
        assert!(engine.tick(&mut bank, ist(8, 5, 1)).is_empty());
        assert!(bank.get(id).status);
    }

    #[test]
    fn schedule_fires_once_per_crossing() {
        let id = relay(4);
        let mut engine = engine_with(
            id,
            RelayRules {
                schedule: DailySchedule {
                    on: "18:00".parse().ok(),
                    off: "23:00".parse().ok(),
                    days: Vec::new(),
                },
                ..RelayRules::default()
            },
        );
        let mut bank = RelayBank::default();

        assert!(engine.tick(&mut bank, ist(17, 59, 59)).is_empty());
        let actions = engine.tick(&mut bank, ist(18, 0, 0));
        assert_eq!(causes(&actions), vec![(id, ActionCause::ScheduleOn)]);
        assert!(engine.tick(&mut bank, ist(18, 0, 1)).is_empty());

        engine.manual_switch(&mut bank, id, false, ist(18, 5, 0));
        assert!(engine.tick(&mut bank, ist(18, 5, 1)).is_empty());
        assert!(!bank.get(id).status);
    }

    #[test]
    fn restored_tick_replays_schedule_edge() {
        let id = relay(4);
        let mut engine = engine_with(
            id,
            RelayRules {
                schedule: DailySchedule {
                    on: "18:00".parse().ok(),
                    off: None,
                    days: Vec::new(),
                },
                ..RelayRules::default()
            },
        );
        let mut bank = RelayBank::default();
        engine.tick(&mut bank, ist(17, 59, 59));

        let checkpoint = engine.checkpoint();
        let fired = engine.tick(&mut bank, ist(18, 0, 0));
        assert_eq!(causes(&fired), vec![(id, ActionCause::ScheduleOn)]);

        // Saving failed: the stored copy is still off.
        engine.restore(checkpoint);
        let mut reloaded = RelayBank::default();
        let retry = engine.tick(&mut reloaded, ist(18, 0, 1));
        assert_eq!(causes(&retry), vec![(id, ActionCause::ScheduleOn)]);
        assert!(reloaded.get(id).status);
    }

    #[test]
    fn schedule_catchup_is_capped() {
        let rules = RelayRules {
            schedule: DailySchedule {
                on: "18:00".parse().ok(),
                off: None,
                days: Vec::new(),
            },
            ..RelayRules::default()
        };
        let id = relay(2);

        let mut recent = engine_with(id, rules.clone());
        let mut bank = RelayBank::default();
        recent.tick(&mut bank, ist(17, 30, 0));
        let actions = recent.tick(&mut bank, ist(18, 45, 0));
        assert_eq!(causes(&actions), vec![(id, ActionCause::ScheduleOn)]);

        let mut stale = engine_with(id, rules);
        let mut bank = RelayBank::default();
        stale.tick(&mut bank, ist(17, 30, 0));
        assert!(stale.tick(&mut bank, ist(19, 30, 0)).is_empty());
        assert!(!bank.get(id).status);
    }

    #[test]
    fn manual_toggle_counts_time_once() {
        let id = relay(1);
        let mut engine = engine_with(id, RelayRules::default());
        let mut bank = RelayBank::default();

        engine.manual_switch(&mut bank, id, true, ist(8, 0, 0));
        let off = engine.manual_switch(&mut bank, id, false, ist(8, 30, 0)).unwrap();
        assert_eq!(off.transition.accrued_secs, 1_800);
        assert_eq!(engine.manual_switch(&mut bank, id, false, ist(8, 31, 0)), None);
        assert_eq!(bank.get(id).total_on_time, 1_800);
    }

    #[test]
    fn rule_updates_report_changes() {
        let id = relay(1);
        let mut engine = engine_with(id, RelayRules::default());

        assert!(!engine.set_rules(id, RelayRules::default()));
        assert!(engine.set_rules(
            id,
            RelayRules {
                manual_override: true,
                ..RelayRules::default()
            }
        ));
        assert!(engine.rules().get(id).manual_override);
    }
}
