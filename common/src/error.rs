#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid relay id `{0}`, expected relay1..relay4")]
    InvalidRelayId(String),
    #[error("invalid time of day `{0}`, expected HH:MM")]
    InvalidTimeOfDay(String),
}
