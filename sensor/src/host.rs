use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, LastWill, MqttOptions, QoS};
use tracing::{info, warn};

use relay_common::{TOPIC_PIR_MOTION, TOPIC_PIR_STATUS};

const SIMULATED_PERIOD_SECS: u64 = 60;
const SIMULATED_MOTION_SECS: u64 = 5;

enum PirSource {
    /// A sysfs-style GPIO value file reading `0` or `1`.
    Gpio(PathBuf),
    Simulated(Instant),
}

impl PirSource {
    fn from_env() -> Self {
        match std::env::var("PIR_GPIO_PATH") {
            Ok(path) => Self::Gpio(PathBuf::from(path)),
            Err(_) => Self::Simulated(Instant::now()),
        }
    }

    async fn read(&self) -> anyhow::Result<bool> {
        match self {
            Self::Gpio(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read PIR line {}", path.display()))?;
                Ok(raw.trim() == "1")
            }
            Self::Simulated(started) => {
                Ok(started.elapsed().as_secs() % SIMULATED_PERIOD_SECS < SIMULATED_MOTION_SECS)
            }
        }
    }
}

/// Reports a level change only once it has held for `window`.
struct Debouncer {
    stable: bool,
    pending_since: Option<Instant>,
    window: Duration,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            stable: false,
            pending_since: None,
            window,
        }
    }

    fn update(&mut self, level: bool, now: Instant) -> Option<bool> {
        if level == self.stable {
            self.pending_since = None;
            return None;
        }

        let since = *self.pending_since.get_or_insert(now);
        if now.duration_since(since) < self.window {
            return None;
        }

        self.stable = level;
        self.pending_since = None;
        Some(level)
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let poll_ms = env_millis("PIR_POLL_MS", 100);
    let debounce_ms = env_millis("PIR_DEBOUNCE_MS", 300);

    let mut mqtt_options = MqttOptions::new("relay-pir-sensor-rust", mqtt_host, mqtt_port);
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_PIR_STATUS,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_PIR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    let source = PirSource::from_env();
    match &source {
        PirSource::Gpio(path) => info!("reading PIR line from {}", path.display()),
        PirSource::Simulated(_) => info!("no PIR_GPIO_PATH set, simulating motion"),
    }

    let mut debouncer = Debouncer::new(Duration::from_millis(debounce_ms));
    let mut interval = tokio::time::interval(Duration::from_millis(poll_ms));

    loop {
        interval.tick().await;

        let level = match source.read().await {
            Ok(level) => level,
            Err(err) => {
                warn!("{err:#}");
                continue;
            }
        };

        let Some(motion) = debouncer.update(level, Instant::now()) else {
            continue;
        };

        info!("motion {}", if motion { "detected" } else { "cleared" });
        mqtt.publish(
            TOPIC_PIR_MOTION,
            QoS::AtLeastOnce,
            false,
            if motion { "1" } else { "0" },
        )
        .await
        .context("failed to publish PIR motion")?;
    }
}

fn env_millis(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debouncer_ignores_short_glitches() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(300));

        assert_eq!(debouncer.update(true, start), None);
        assert_eq!(debouncer.update(false, start + Duration::from_millis(100)), None);
        assert_eq!(debouncer.update(true, start + Duration::from_millis(200)), None);
        assert_eq!(debouncer.update(true, start + Duration::from_millis(400)), None);
        assert_eq!(
            debouncer.update(true, start + Duration::from_millis(500)),
            Some(true)
        );
        assert_eq!(debouncer.update(true, start + Duration::from_millis(600)), None);
    }

    #[test]
    fn debouncer_reports_falling_edge() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::ZERO);

        assert_eq!(debouncer.update(true, start), Some(true));
        assert_eq!(debouncer.update(false, start), Some(false));
        assert_eq!(debouncer.update(false, start), None);
    }
}
