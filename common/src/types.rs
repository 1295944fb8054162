use std::{fmt, str::FromStr};

use chrono::{DateTime, FixedOffset};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{error::Error, rules::RelayRules};

pub const RELAY_COUNT: u8 = 4;

pub type Timestamp = DateTime<FixedOffset>;

/// One of the four relays, addressed as `relay1`..`relay4` in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayId(u8);

impl RelayId {
    pub fn new(number: u8) -> Result<Self, Error> {
        if (1..=RELAY_COUNT).contains(&number) {
            Ok(Self(number))
        } else {
            Err(Error::InvalidRelayId(number.to_string()))
        }
    }

    pub fn all() -> impl Iterator<Item = RelayId> {
        (1..=RELAY_COUNT).map(Self)
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn slot(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn key(self) -> String {
        format!("relay{}", self.0)
    }

    pub fn default_name(self) -> String {
        format!("Relay {}", self.0)
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay{}", self.0)
    }
}

impl FromStr for RelayId {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix("relay").unwrap_or(trimmed);
        digits
            .parse::<u8>()
            .ok()
            .and_then(|number| Self::new(number).ok())
            .ok_or_else(|| Error::InvalidRelayId(raw.to_string()))
    }
}

impl Serialize for RelayId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RelayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// A relay as persisted under `relays/relayN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: bool,
    #[serde(default, deserialize_with = "lenient_name")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_on: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_off: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub total_on_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub on: bool,
    pub at: Timestamp,
    pub accrued_secs: u64,
}

impl RelayRecord {
    pub fn new(id: RelayId) -> Self {
        Self {
            status: false,
            name: id.default_name(),
            last_on: None,
            last_off: None,
            total_on_time: 0,
        }
    }

    /// Moves the relay to `on`. Turning off adds the finished session to
    /// `total_on_time`; a relay that is already in the requested state is
    /// left untouched.
    pub fn switch(&mut self, on: bool, now: Timestamp) -> Option<Transition> {
        if self.status == on {
            return None;
        }

        let accrued_secs = if on { 0 } else { self.session_secs(now) };
        self.status = on;
        if on {
            self.last_on = Some(now);
        } else {
            self.last_off = Some(now);
            self.total_on_time = self.total_on_time.saturating_add(accrued_secs);
        }

        Some(Transition {
            on,
            at: now,
            accrued_secs,
        })
    }

    /// Seconds spent in the current on-session, zero when off or when the
    /// session start is unknown.
    pub fn session_secs(&self, now: Timestamp) -> u64 {
        match self.last_on {
            Some(started) if self.status && started <= now => {
                u64::try_from((now - started).num_seconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn on_time_secs(&self, now: Timestamp) -> u64 {
        self.total_on_time.saturating_add(self.session_secs(now))
    }

    /// Zeroes the usage counter. A running session restarts at `now` so the
    /// time before the reset is not counted again on the next switch-off.
    pub fn reset_usage(&mut self, now: Timestamp) {
        self.total_on_time = 0;
        if self.status {
            self.last_on = Some(now);
        }
    }

    pub fn view(
        &self,
        id: RelayId,
        rules: &RelayRules,
        pir_controlled: bool,
        now: Timestamp,
    ) -> RelayView {
        let on_time = self.on_time_secs(now);
        RelayView {
            key: id.key(),
            name: self.name.clone(),
            status: self.status,
            last_on: self.last_on.map(|at| at.to_rfc3339()),
            last_off: self.last_off.map(|at| at.to_rfc3339()),
            total_on_secs: self.total_on_time,
            total_on_display: format_duration(self.total_on_time),
            on_time_secs: on_time,
            on_time_display: format_duration(on_time),
            rules: rules.clone(),
            pir_controlled,
            next_schedule_event_epoch: rules.schedule.next_event_epoch(now),
        }
    }

    pub fn state_payload(&self, now: Timestamp) -> RelayStatePayload {
        RelayStatePayload {
            status: if self.status { "ON" } else { "OFF" },
            name: self.name.clone(),
            on_time_secs: self.on_time_secs(now),
        }
    }
}

/// The four relays, always fully populated.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayBank {
    records: [RelayRecord; RELAY_COUNT as usize],
}

impl Default for RelayBank {
    fn default() -> Self {
        Self {
            records: std::array::from_fn(|slot| RelayRecord::new(RelayId(slot as u8 + 1))),
        }
    }
}

impl RelayBank {
    /// Builds a bank from the `relays` subtree. Relays whose key is absent
    /// are filled with defaults and reported back so the caller can seed
    /// them. A present record that cannot be read still gets defaults here
    /// but is not reported, so it is never overwritten wholesale.
    pub fn from_tree(tree: Option<&Value>) -> (Self, Vec<RelayId>) {
        let mut bank = Self::default();
        let mut missing = Vec::new();

        for id in RelayId::all() {
            let Some(raw) = tree
                .and_then(|relays| relays.get(id.key()))
                .filter(|raw| !raw.is_null())
            else {
                missing.push(id);
                continue;
            };

            let Ok(mut record) = serde_json::from_value::<RelayRecord>(raw.clone()) else {
                continue;
            };
            if record.name.trim().is_empty() {
                record.name = id.default_name();
            }
            bank.records[id.slot()] = record;
        }

        (bank, missing)
    }

    pub fn get(&self, id: RelayId) -> &RelayRecord {
        &self.records[id.slot()]
    }

    pub fn get_mut(&mut self, id: RelayId) -> &mut RelayRecord {
        &mut self.records[id.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (RelayId, &RelayRecord)> {
        RelayId::all().zip(self.records.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayView {
    pub key: String,
    pub name: String,
    pub status: bool,
    #[serde(rename = "lastOn")]
    pub last_on: Option<String>,
    #[serde(rename = "lastOff")]
    pub last_off: Option<String>,
    #[serde(rename = "totalOnSecs")]
    pub total_on_secs: u64,
    #[serde(rename = "totalOnDisplay")]
    pub total_on_display: String,
    #[serde(rename = "onTimeSecs")]
    pub on_time_secs: u64,
    #[serde(rename = "onTimeDisplay")]
    pub on_time_display: String,
    pub rules: RelayRules,
    #[serde(rename = "pirControlled")]
    pub pir_controlled: bool,
    #[serde(rename = "nextScheduleEventEpoch")]
    pub next_schedule_event_epoch: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatePayload {
    pub status: &'static str,
    pub name: String,
    #[serde(rename = "onTimeSecs")]
    pub on_time_secs: u64,
}

pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw.trim()).ok()
}

/// Renders seconds the way the dashboard always has: `H:MM:SS`, prefixed
/// with a day count past 24 hours.
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let clock = format!("{hours}:{minutes:02}:{seconds:02}");
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(parse_timestamp))
}

fn lenient_status<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let status = match raw {
        Some(Value::Bool(on)) => on,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "on" | "true"
        ),
        _ => false,
    };
    Ok(status)
}

fn lenient_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let name = match raw {
        Some(Value::String(text)) => text,
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    };
    Ok(name)
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let seconds = match raw {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite() && *v > 0.0).map(|v| v as u64))
            .unwrap_or(0),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(|v| v as u64)
            .unwrap_or(0),
        _ => 0,
    };
    Ok(seconds)
}
