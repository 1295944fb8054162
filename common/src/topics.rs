use crate::types::RelayId;

pub const TOPIC_PIR_MOTION: &str = "relays/sensor/pir/motion";
pub const TOPIC_PIR_STATUS: &str = "relays/sensor/pir/status";

pub const TOPIC_CONTROLLER_STATE: &str = "relays/controller/state";

pub const TOPIC_CMD_POWER_FILTER: &str = "relays/cmnd/+/power";

pub fn relay_power_topic(id: RelayId) -> String {
    format!("relays/cmnd/{id}/power")
}

pub fn relay_state_topic(id: RelayId) -> String {
    format!("relays/stat/{id}")
}

/// Extracts the relay addressed by a `relays/cmnd/<relay>/power` topic.
pub fn parse_power_topic(topic: &str) -> Option<RelayId> {
    let key = topic.strip_prefix("relays/cmnd/")?.strip_suffix("/power")?;
    key.parse().ok()
}
