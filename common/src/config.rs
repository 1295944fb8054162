use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub auto_on_grace_secs: u64,
    pub schedule_catchup_secs: u64,
    pub rules_refresh_ms: u64,
    pub state_publish_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            auto_on_grace_secs: 300,
            schedule_catchup_secs: 3_600,
            rules_refresh_ms: 30_000,
            state_publish_interval_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(200, 60_000);
        self.auto_on_grace_secs = self.auto_on_grace_secs.clamp(5, 86_400);
        self.schedule_catchup_secs = self.schedule_catchup_secs.clamp(1, 86_400);
        self.rules_refresh_ms = self.rules_refresh_ms.clamp(1_000, 3_600_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(1_000, 3_600_000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    Firebase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: String,
    pub auth_token: String,
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            database_url: String::new(),
            auth_token: String::new(),
            request_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn sanitize(&mut self) {
        self.database_url = self.database_url.trim().trim_end_matches('/').to_string();
        if self.backend == StoreBackend::Firebase && self.database_url.is_empty() {
            self.backend = StoreBackend::File;
        }
        self.request_timeout_ms = self.request_timeout_ms.clamp(500, 60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub timezone: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timezone: "Asia/Kolkata".to_string(),
            store: StoreConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.engine.sanitize();
        self.store.sanitize();
        if self.timezone.trim().is_empty() {
            self.timezone = Self::default().timezone;
        }
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = 1883;
        }
    }
}
