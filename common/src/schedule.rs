use std::{fmt, str::FromStr};

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Weekday};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{error::Error, types::Timestamp};

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    #[serde(alias = "MONDAY")]
    Mon,
    #[serde(alias = "TUESDAY")]
    Tue,
    #[serde(alias = "WEDNESDAY")]
    Wed,
    #[serde(alias = "THURSDAY")]
    Thu,
    #[serde(alias = "FRIDAY")]
    Fri,
    #[serde(alias = "SATURDAY")]
    Sat,
    #[serde(alias = "SUNDAY")]
    Sun,
}

impl DayOfWeek {
    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

/// Minutes after local midnight, written as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour.checked_mul(60)?.checked_add(minute)?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    fn on_date(self, date: NaiveDate, offset: &FixedOffset) -> Option<Timestamp> {
        let naive = date.and_hms_opt(u32::from(self.0 / 60), u32::from(self.0 % 60), 0)?;
        offset.from_local_datetime(&naive).single()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidTimeOfDay(raw.to_string());
        let mut parts = raw.trim().split(':');

        let hour = parts.next().and_then(|h| h.parse::<u16>().ok());
        let minute = parts.next().and_then(|m| m.parse::<u16>().ok());
        // Seconds are tolerated but ignored.
        let second_ok = parts
            .next()
            .map(|s| s.parse::<f32>().is_ok())
            .unwrap_or(true);

        match (hour, minute) {
            (Some(hour), Some(minute)) if second_ok && parts.next().is_none() => {
                Self::from_hm(hour, minute).ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Minutes(minutes) => u16::try_from(minutes)
                .ok()
                .and_then(Self::from_minutes)
                .ok_or_else(|| de::Error::custom(format!("{minutes} is not a minute of the day"))),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// Time-of-day switching for one relay. An empty `days` list means every day.
///
/// Decoding drops entries it cannot read instead of failing, so one bad
/// time or day never discards the rest of a relay's rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailySchedule {
    #[serde(default, deserialize_with = "lenient_time")]
    pub on: Option<TimeOfDay>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub off: Option<TimeOfDay>,
    #[serde(default, deserialize_with = "lenient_days")]
    pub days: Vec<DayOfWeek>,
}

fn lenient_time<'de, D>(deserializer: D) -> Result<Option<TimeOfDay>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
}

fn lenient_days<'de, D>(deserializer: D) -> Result<Vec<DayOfWeek>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let days = match raw {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| {
                let text = item.as_str()?.trim().to_ascii_uppercase();
                serde_json::from_value(serde_json::Value::String(text)).ok()
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(days)
}

impl DailySchedule {
    pub fn is_empty(&self) -> bool {
        self.on.is_none() && self.off.is_none()
    }

    pub fn sanitize(&mut self) {
        self.days.sort();
        self.days.dedup();
    }

    pub fn runs_on(&self, day: DayOfWeek) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    fn events(&self) -> impl Iterator<Item = (TimeOfDay, bool)> {
        self.on
            .map(|at| (at, true))
            .into_iter()
            .chain(self.off.map(|at| (at, false)))
    }

    /// The scheduled switch whose time falls in `(previous, now]`, `true`
    /// for on. Without a previous evaluation only an event in the current
    /// minute counts. If several events fall in the window the latest wins,
    /// and off wins a tie.
    pub fn edge_between(&self, previous: Option<Timestamp>, now: Timestamp) -> Option<bool> {
        if self.is_empty() {
            return None;
        }

        let start = match previous {
            Some(previous) => previous,
            None => now.with_second(0)?.with_nanosecond(0)? - Duration::seconds(1),
        };
        if start >= now {
            return None;
        }

        let mut best: Option<(Timestamp, bool)> = None;
        let mut date = start.date_naive();
        let last = now.date_naive();

        while date <= last {
            if self.runs_on(DayOfWeek::from_chrono(date.weekday())) {
                for (time, on) in self.events() {
                    let Some(at) = time.on_date(date, now.offset()) else {
                        continue;
                    };
                    if at <= start || at > now {
                        continue;
                    }

                    let replaces = match best {
                        Some((current, _)) => at > current || (at == current && !on),
                        None => true,
                    };
                    if replaces {
                        best = Some((at, on));
                    }
                }
            }

            let Some(next) = date.succ_opt() else {
                break;
            };
            date = next;
        }

        best.map(|(_, on)| on)
    }

    pub fn next_event_epoch(&self, now: Timestamp) -> Option<i64> {
        if self.is_empty() {
            return None;
        }

        let mut best: Option<Timestamp> = None;

        for day_offset in 0..=7i64 {
            let date = now.date_naive() + Duration::days(day_offset);
            if !self.runs_on(DayOfWeek::from_chrono(date.weekday())) {
                continue;
            }

            for (time, _) in self.events() {
                let Some(candidate) = time.on_date(date, now.offset()) else {
                    continue;
                };
                if candidate <= now {
                    continue;
                }

                if best.map(|current| candidate < current).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }

        best.map(|dt| dt.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn ist(day: u32, hour: u32, minute: u32, second: u32) -> Timestamp {
        FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, second)
            .unwrap()
    }

    fn lights(on: &str, off: &str) -> DailySchedule {
        DailySchedule {
            on: Some(on.parse().unwrap()),
            off: Some(off.parse().unwrap()),
            days: Vec::new(),
        }
    }

    #[test]
    fn parses_times_of_day() {
        assert_eq!("07:30".parse::<TimeOfDay>().unwrap().minutes(), 450);
        assert_eq!("7:05:00".parse::<TimeOfDay>().unwrap().minutes(), 425);
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());

        let schedule: DailySchedule =
            serde_json::from_value(json!({"on": "18:45", "off": 1380})).unwrap();
        assert_eq!(schedule.on.unwrap().to_string(), "18:45");
        assert_eq!(schedule.off.unwrap().to_string(), "23:00");
    }

    #[test]
    fn fires_when_crossing_scheduled_time() {
        let schedule = lights("18:00", "23:00");

        let fired = schedule.edge_between(Some(ist(5, 17, 59, 59)), ist(5, 18, 0, 0));
        assert_eq!(fired, Some(true));

        let quiet = schedule.edge_between(Some(ist(5, 18, 0, 0)), ist(5, 18, 0, 1));
        assert_eq!(quiet, None);
    }

    #[test]
    fn first_evaluation_only_sees_current_minute() {
        let schedule = lights("18:00", "23:00");

        assert_eq!(schedule.edge_between(None, ist(5, 18, 0, 42)), Some(true));
        assert_eq!(schedule.edge_between(None, ist(5, 18, 1, 0)), None);
    }

    #[test]
    fn off_wins_when_both_events_share_a_minute() {
        let schedule = lights("21:00", "21:00");

        let fired = schedule.edge_between(Some(ist(5, 20, 59, 0)), ist(5, 21, 0, 0));
        assert_eq!(fired, Some(false));
    }

    #[test]
    fn unreadable_times_and_days_are_dropped() {
        let schedule: DailySchedule = serde_json::from_value(json!({
            "on": 1500,
            "off": "22:30",
            "days": ["sat", "SUNDAY", "someday", 3]
        }))
        .unwrap();

        assert_eq!(schedule.on, None);
        assert_eq!(schedule.off.unwrap().to_string(), "22:30");
        assert_eq!(schedule.days, vec![DayOfWeek::Sat, DayOfWeek::Sun]);
    }

    #[test]
    fn window_across_midnight_picks_latest_event() {
        let schedule = lights("00:10", "23:50");

        let fired = schedule.edge_between(Some(ist(5, 23, 0, 0)), ist(6, 0, 30, 0));
        assert_eq!(fired, Some(true));
    }

    #[test]
    fn respects_day_filter() {
        let mut schedule = lights("06:00", "07:00");
        schedule.days = vec![DayOfWeek::Sat, DayOfWeek::Sun];

        // Jan 5, 2026 is a Monday.
        assert_eq!(schedule.edge_between(None, ist(5, 6, 0, 0)), None);
        assert_eq!(schedule.edge_between(None, ist(10, 6, 0, 0)), Some(true));
    }

    #[test]
    fn finds_next_event() {
        let schedule = lights("18:00", "23:00");

        let next = schedule.next_event_epoch(ist(5, 18, 0, 1)).unwrap();
        assert_eq!(next, ist(5, 23, 0, 0).timestamp());

        let tomorrow = schedule.next_event_epoch(ist(5, 23, 30, 0)).unwrap();
        assert_eq!(tomorrow, ist(6, 18, 0, 0).timestamp());

        assert_eq!(DailySchedule::default().next_event_epoch(ist(5, 0, 0, 0)), None);
    }
}
