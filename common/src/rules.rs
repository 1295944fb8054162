use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    schedule::DailySchedule,
    types::{RelayId, RELAY_COUNT},
};

pub const DEFAULT_PIR_HOLD_SECS: u64 = 120;
const MIN_PIR_HOLD_SECS: u64 = 5;
const MAX_PIR_HOLD_SECS: u64 = 86_400;

/// Automation configured for a single relay, stored under `rules/relayN`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayRules {
    #[serde(default, deserialize_with = "lenient_duration")]
    pub auto_off_after_secs: Option<u64>,
    #[serde(default, deserialize_with = "lenient_duration")]
    pub auto_on_after_secs: Option<u64>,
    #[serde(default)]
    pub schedule: DailySchedule,
    /// Suspends every automatic rule, PIR included, for this relay.
    #[serde(default)]
    pub manual_override: bool,
}

impl RelayRules {
    /// Decodes a stored rule object, falling back to no automation when the
    /// stored value is missing or malformed.
    pub fn from_value(raw: Option<&Value>) -> Self {
        let mut rules = raw
            .filter(|value| value.is_object())
            .and_then(|value| serde_json::from_value::<Self>(value.clone()).ok())
            .unwrap_or_default();
        rules.sanitize();
        rules
    }

    pub fn sanitize(&mut self) {
        self.auto_off_after_secs = self.auto_off_after_secs.filter(|secs| *secs > 0);
        self.auto_on_after_secs = self.auto_on_after_secs.filter(|secs| *secs > 0);
        self.schedule.sanitize();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PirSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "lenient_relay_list")]
    pub relays: Vec<RelayId>,
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
}

impl Default for PirSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            relays: Vec::new(),
            hold_secs: DEFAULT_PIR_HOLD_SECS,
        }
    }
}

impl PirSettings {
    pub fn from_value(raw: Option<&Value>) -> Self {
        let mut settings = raw
            .filter(|value| value.is_object())
            .and_then(|value| serde_json::from_value::<Self>(value.clone()).ok())
            .unwrap_or_default();
        settings.sanitize();
        settings
    }

    pub fn sanitize(&mut self) {
        self.relays.sort();
        self.relays.dedup();
        self.hold_secs = self.hold_secs.clamp(MIN_PIR_HOLD_SECS, MAX_PIR_HOLD_SECS);
    }

    pub fn controls(&self, id: RelayId) -> bool {
        self.enabled && self.relays.contains(&id)
    }
}

/// Rules for every relay plus the shared PIR settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    relays: [RelayRules; RELAY_COUNT as usize],
    pub pir: PirSettings,
}

impl RuleSet {
    /// Builds the rule set from the `rules` and `pir_settings` subtrees.
    pub fn from_tree(rules: Option<&Value>, pir: Option<&Value>) -> Self {
        let mut set = Self {
            pir: PirSettings::from_value(pir),
            ..Self::default()
        };
        for id in RelayId::all() {
            set.relays[id.slot()] =
                RelayRules::from_value(rules.and_then(|tree| tree.get(id.key())));
        }
        set
    }

    pub fn get(&self, id: RelayId) -> &RelayRules {
        &self.relays[id.slot()]
    }

    pub fn set(&mut self, id: RelayId, mut rules: RelayRules) {
        rules.sanitize();
        self.relays[id.slot()] = rules;
    }
}

fn default_hold_secs() -> u64 {
    DEFAULT_PIR_HOLD_SECS
}

/// Whole seconds from a number or numeric string; anything else, including
/// negatives, reads as unset.
fn lenient_duration<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let seconds = match raw {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64)),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    Ok(seconds)
}

fn lenient_relay_list<'de, D>(deserializer: D) -> Result<Vec<RelayId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|key| key.parse().ok())
        .collect())
}
