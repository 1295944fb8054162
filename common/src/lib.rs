pub mod config;
pub mod engine;
pub mod error;
pub mod rules;
pub mod schedule;
pub mod topics;
pub mod tree;
pub mod types;

pub use config::{EngineConfig, NetworkConfig, RuntimeConfig, StoreBackend, StoreConfig};
pub use engine::{ActionCause, RelayAction, RelayEngine, TickCheckpoint};
pub use error::Error;
pub use rules::{PirSettings, RelayRules, RuleSet};
pub use schedule::{DailySchedule, DayOfWeek, TimeOfDay};
pub use topics::*;
pub use types::{
    format_duration, parse_timestamp, RelayBank, RelayId, RelayRecord, RelayStatePayload,
    RelayView, Timestamp, Transition,
};
