use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use relay_common::{
    parse_power_topic, relay_state_topic, PirSettings, RelayAction, RelayBank, RelayEngine,
    RelayId, RelayRules, RelayStatePayload, RelayView, RuntimeConfig, StoreBackend, Timestamp,
    TOPIC_CMD_POWER_FILTER, TOPIC_CONTROLLER_STATE, TOPIC_PIR_MOTION,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::store::RealtimeStore;

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MAX_NAME_CHARS: usize = 40;

#[derive(Clone)]
struct AppState {
    // Lock order: bank before engine.
    bank: Arc<Mutex<RelayBank>>,
    engine: Arc<Mutex<RelayEngine>>,
    timezone: Arc<Mutex<String>>,
    store: RealtimeStore,
    config: ConfigStore,
    mqtt: AsyncClient,
}

/// `runtime.json` in the data directory.
#[derive(Clone)]
struct ConfigStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerCommand {
    On,
    Off,
    Toggle,
}

impl PowerCommand {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(Self::On),
            "off" | "0" | "false" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }

    fn resolve(self, current: bool) -> bool {
        match self {
            Self::On => true,
            Self::Off => false,
            Self::Toggle => !current,
        }
    }
}

/// A retained relay state message, sent once the bank lock is released.
#[derive(Debug)]
struct StateUpdate {
    topic: String,
    body: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct DashboardStatus {
    relays: Vec<RelayView>,
    pir: PirSettings,
    #[serde(rename = "motionActive")]
    motion_active: bool,
    #[serde(rename = "motionRemainingSecs")]
    motion_remaining_secs: u64,
    #[serde(rename = "lastMotion")]
    last_motion: Option<String>,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
    #[serde(rename = "storeBackend")]
    store_backend: StoreBackend,
}

#[derive(Debug, Serialize)]
struct ControllerState {
    relays: HashMap<String, RelayStatePayload>,
    motion: bool,
}

#[derive(Debug, Deserialize)]
struct NameUpdate {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
    #[serde(rename = "localTime")]
    local_time: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = data_dir();
    let config = ConfigStore::new(&data_dir);
    let mut runtime = config.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("unknown timezone {:?}, using default", runtime.timezone);
        runtime.timezone = RuntimeConfig::default().timezone;
    }

    let store = RealtimeStore::open(&runtime.store, &data_dir)
        .context("failed to open realtime store")?;
    info!("using {} store", store.describe());

    let rules = store.load_rules().await.unwrap_or_else(|err| {
        warn!("failed to load rules from store: {err:#}");
        Default::default()
    });
    let engine = RelayEngine::new(runtime.engine.clone(), rules);

    let mut mqtt_options = MqttOptions::new(
        "relay-controller-rust",
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        bank: Arc::new(Mutex::new(RelayBank::default())),
        engine: Arc::new(Mutex::new(engine)),
        timezone: Arc::new(Mutex::new(runtime.timezone.clone())),
        store,
        config,
        mqtt,
    };

    {
        let mut bank = app_state.bank.lock().await;
        if let Err(err) = sync_bank(&app_state, &mut bank).await {
            warn!("initial relay sync failed: {err:#}");
        }
    }

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), runtime.engine.tick_interval_ms);
    spawn_rules_refresh_loop(app_state.clone(), runtime.engine.rules_refresh_ms);
    spawn_state_publish_loop(app_state.clone(), runtime.engine.state_publish_interval_ms);

    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("relay dashboard listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/relays/{key}/power", post(handle_set_power))
        .route("/api/relays/{key}/name", put(handle_put_name))
        .route(
            "/api/relays/{key}/rules",
            get(handle_get_rules).put(handle_put_rules),
        )
        .route("/api/relays/{key}/usage/reset", post(handle_reset_usage))
        .route("/api/pir", get(handle_get_pir).put(handle_put_pir))
        .route("/api/pir/motion", post(handle_pir_motion))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state)
}

fn data_dir() -> PathBuf {
    std::env::var("RELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relay-controller"))
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(url) = std::env::var("FIREBASE_DATABASE_URL") {
        runtime.store.backend = StoreBackend::Firebase;
        runtime.store.database_url = url;
    }
    if let Ok(token) = std::env::var("FIREBASE_AUTH_TOKEN") {
        runtime.store.auth_token = token;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = env_port("MQTT_PORT") {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(port) = env_port("RELAY_HTTP_PORT") {
        runtime.network.http_port = port;
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_PIR_MOTION, TOPIC_CMD_POWER_FILTER] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, tick_interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now = current_time(&app_state).await;
            if let Err(err) = run_control_tick(&app_state, now).await {
                warn!("control tick skipped: {err:#}");
            }
        }
    });
}

fn spawn_rules_refresh_loop(app_state: AppState, refresh_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(refresh_ms));
        // The first tick fires immediately and startup already loaded the rules.
        interval.tick().await;

        loop {
            interval.tick().await;
            match app_state.store.load_rules().await {
                Ok(rules) => {
                    if app_state.engine.lock().await.replace_rules(rules) {
                        info!("rules changed in store, reloaded");
                    }
                }
                Err(err) => warn!("rules refresh failed: {err:#}"),
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;

            let now = current_time(&app_state).await;
            let payload = {
                let bank = app_state.bank.lock().await;
                let engine = app_state.engine.lock().await;
                let state = ControllerState {
                    relays: bank
                        .iter()
                        .map(|(id, record)| (id.key(), record.state_payload(now)))
                        .collect(),
                    motion: engine.motion_active(now),
                };
                serde_json::to_vec(&state)
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state.mqtt.try_publish(
                        TOPIC_CONTROLLER_STATE,
                        QoS::AtLeastOnce,
                        true,
                        body,
                    ) {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

/// Pulls the latest relays from the store, seeding any that are missing.
async fn sync_bank(state: &AppState, bank: &mut RelayBank) -> anyhow::Result<()> {
    let (fresh, missing) = state
        .store
        .load_bank()
        .await
        .context("failed to read relays from store")?;

    for id in missing {
        state
            .store
            .save_relay(id, fresh.get(id))
            .await
            .with_context(|| format!("failed to seed {id}"))?;
        info!("seeded missing relay {id}");
    }

    *bank = fresh;
    Ok(())
}

async fn run_control_tick(state: &AppState, now: Timestamp) -> anyhow::Result<()> {
    let updates = {
        let mut bank = state.bank.lock().await;
        sync_bank(state, &mut bank).await?;

        let (checkpoint, actions) = {
            let mut engine = state.engine.lock().await;
            (engine.checkpoint(), engine.tick(&mut bank, now))
        };

        match persist_actions(state, &bank, &actions).await {
            Ok(updates) => updates,
            Err(err) => {
                // The store still has the old records; replay this tick next time.
                state.engine.lock().await.restore(checkpoint);
                return Err(err);
            }
        }
    };

    publish_states(&state.mqtt, updates);
    Ok(())
}

async fn apply_manual(
    state: &AppState,
    id: RelayId,
    command: PowerCommand,
) -> anyhow::Result<Option<RelayAction>> {
    let now = current_time(state).await;

    let (action, updates) = {
        let mut bank = state.bank.lock().await;
        sync_bank(state, &mut bank).await?;

        let on = command.resolve(bank.get(id).status);
        let action = {
            let mut engine = state.engine.lock().await;
            engine.manual_switch(&mut bank, id, on, now)
        };

        let updates = persist_actions(state, &bank, action.as_slice()).await?;
        (action, updates)
    };

    publish_states(&state.mqtt, updates);
    Ok(action)
}

/// Saves the relays touched by `actions` and returns their state messages.
async fn persist_actions(
    state: &AppState,
    bank: &RelayBank,
    actions: &[RelayAction],
) -> anyhow::Result<Vec<StateUpdate>> {
    let mut updates = Vec::with_capacity(actions.len());

    for action in actions {
        let record = bank.get(action.relay);
        state
            .store
            .save_relay(action.relay, record)
            .await
            .with_context(|| format!("failed to persist {}", action.relay))?;

        info!(
            "relay {} {} ({}), accrued {}s, total {}s",
            action.relay,
            if action.is_on() { "ON" } else { "OFF" },
            action.cause.as_str(),
            action.transition.accrued_secs,
            record.total_on_time
        );

        match serde_json::to_vec(&record.state_payload(action.transition.at)) {
            Ok(body) => updates.push(StateUpdate {
                topic: relay_state_topic(action.relay),
                body,
            }),
            Err(err) => warn!("relay state serialization failed: {err}"),
        }
    }

    Ok(updates)
}

/// Queues state messages without waiting, so a stalled broker never holds
/// up the control loop or the MQTT event loop that calls into it.
fn publish_states(mqtt: &AsyncClient, updates: Vec<StateUpdate>) {
    for update in updates {
        if let Err(err) = mqtt.try_publish(&update.topic, QoS::AtLeastOnce, true, update.body) {
            warn!("relay state publish to {} failed: {err}", update.topic);
        }
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;

    if topic == TOPIC_PIR_MOTION {
        match parse_motion(&message) {
            Some(present) => {
                let now = current_time(app_state).await;
                app_state.engine.lock().await.record_motion(present, now);
            }
            None => warn!("ignoring PIR payload {message:?}"),
        }
        return Ok(());
    }

    if let Some(id) = parse_power_topic(&topic) {
        match PowerCommand::parse(&message) {
            Some(command) => {
                apply_manual(app_state, id, command).await?;
            }
            None => warn!("ignoring power command {message:?} for {id}"),
        }
    }

    Ok(())
}

fn parse_motion(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "motion" => Some(true),
        "0" | "off" | "false" | "clear" => Some(false),
        _ => None,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now = current_time(&state).await;
    let timezone = state.timezone.lock().await.clone();

    let status = {
        let bank = state.bank.lock().await;
        let engine = state.engine.lock().await;
        let rules = engine.rules();

        DashboardStatus {
            relays: bank
                .iter()
                .map(|(id, record)| record.view(id, rules.get(id), rules.pir.controls(id), now))
                .collect(),
            pir: rules.pir.clone(),
            motion_active: engine.motion_active(now),
            motion_remaining_secs: engine.motion_remaining_secs(now),
            last_motion: engine.last_motion().map(|at| at.to_rfc3339()),
            timezone,
            now_epoch: now.timestamp(),
            store_backend: state.store.backend(),
        }
    };

    Json(status)
}

async fn handle_set_power(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Ok(id) = key.parse::<RelayId>() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown relay");
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(command) = PowerCommand::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid power value. Use 'on', 'off' or 'toggle'",
        );
    };

    if let Err(err) = apply_manual(&state, id, command).await {
        warn!("manual switch of {id} failed: {err:#}");
        return error_response(StatusCode::BAD_GATEWAY, "Failed to update relay in store");
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_put_name(
    State(state): State<AppState>,
    Path(key): Path<String>,
    payload: Result<Json<NameUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(id) = key.parse::<RelayId>() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown relay");
    };
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(response) => return response,
    };
    let Some(name) = validate_name(&update.name) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Name must be between 1 and 40 characters",
        );
    };

    {
        let mut bank = state.bank.lock().await;
        if let Err(err) = state.store.rename_relay(id, name).await {
            warn!("failed to rename {id}: {err:#}");
            return error_response(StatusCode::BAD_GATEWAY, "Failed to rename relay in store");
        }
        bank.get_mut(id).name = name.to_string();
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_rules(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let Ok(id) = key.parse::<RelayId>() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown relay");
    };
    let rules = state.engine.lock().await.rules().get(id).clone();
    Json(rules).into_response()
}

async fn handle_put_rules(
    State(state): State<AppState>,
    Path(key): Path<String>,
    payload: Result<Json<RelayRules>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(id) = key.parse::<RelayId>() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown relay");
    };
    let mut rules = match json_body(payload) {
        Ok(rules) => rules,
        Err(response) => return response,
    };
    rules.sanitize();

    if let Err(err) = state.store.save_rules(id, &rules).await {
        warn!("failed to persist rules for {id}: {err:#}");
        return error_response(StatusCode::BAD_GATEWAY, "Failed to persist rules");
    }
    if state.engine.lock().await.set_rules(id, rules) {
        info!("rules updated for {id}");
    }

    handle_get_rules(State(state), Path(key)).await.into_response()
}

async fn handle_reset_usage(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let Ok(id) = key.parse::<RelayId>() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown relay");
    };
    let now = current_time(&state).await;

    let result = {
        let mut bank = state.bank.lock().await;
        match sync_bank(&state, &mut bank).await {
            Ok(()) => {
                bank.get_mut(id).reset_usage(now);
                state
                    .store
                    .save_relay(id, bank.get(id))
                    .await
                    .map_err(anyhow::Error::from)
            }
            Err(err) => Err(err),
        }
    };

    if let Err(err) = result {
        warn!("failed to reset usage for {id}: {err:#}");
        return error_response(StatusCode::BAD_GATEWAY, "Failed to reset relay usage");
    }
    info!("usage counter reset for {id}");

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_pir(State(state): State<AppState>) -> impl IntoResponse {
    let settings = state.engine.lock().await.rules().pir.clone();
    Json(settings)
}

async fn handle_put_pir(
    State(state): State<AppState>,
    payload: Result<Json<PirSettings>, JsonRejection>,
) -> impl IntoResponse {
    let mut settings = match json_body(payload) {
        Ok(settings) => settings,
        Err(response) => return response,
    };
    settings.sanitize();

    if let Err(err) = state.store.save_pir_settings(&settings).await {
        warn!("failed to persist PIR settings: {err:#}");
        return error_response(StatusCode::BAD_GATEWAY, "Failed to persist PIR settings");
    }
    if state.engine.lock().await.set_pir_settings(settings) {
        info!("PIR settings updated");
    }

    handle_get_pir(State(state)).await.into_response()
}

async fn handle_pir_motion(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let raw = params.get("value").map(String::as_str).unwrap_or("1");
    let Some(present) = parse_motion(raw) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid motion value. Use '1' or '0'");
    };

    let now = current_time(&state).await;
    state.engine.lock().await.record_motion(present, now);

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.timezone.lock().await.clone();
    let now = current_time(&state).await;
    Json(TimeStatus {
        timezone,
        now_epoch: now.timestamp(),
        local_time: now.to_rfc3339(),
    })
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    payload: Result<Json<TimezoneUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(response) => return response,
    };
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    {
        let mut timezone = state.timezone.lock().await;
        *timezone = update.timezone.clone();
    }

    if let Err(err) = state.config.save_timezone(&update.timezone).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_time(State(state)).await.into_response()
}

impl ConfigStore {
    fn new(data_dir: &std::path::Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn save_timezone(&self, timezone: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut runtime = self.read().await?;
        runtime.timezone = timezone.to_string();

        let path = self.runtime_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn read(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn current_time(state: &AppState) -> Timestamp {
    let timezone = state.timezone.lock().await.clone();
    now_in_timezone(&timezone).unwrap_or_else(|| Utc::now().fixed_offset())
}

fn now_in_timezone(timezone: &str) -> Option<Timestamp> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

/// Trimmed relay name, or `None` unless it is 1 to 40 characters long.
fn validate_name(raw: &str) -> Option<&str> {
    let name = raw.trim();
    (!name.is_empty() && name.chars().count() <= MAX_NAME_CHARS).then_some(name)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, axum::response::Response> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| error_response(StatusCode::BAD_REQUEST, &rejection.body_text()))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};
    use relay_common::{EngineConfig, RelayRecord, RuleSet};
    use serde_json::{json, Value};

    use super::*;
    use crate::store::FileStore;

    fn ist(hour: u32, minute: u32, second: u32) -> Timestamp {
        FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 5, hour, minute, second)
            .unwrap()
    }

    fn relay(number: u8) -> RelayId {
        RelayId::new(number).unwrap()
    }

    /// App state over a scratch file store and an MQTT client whose event
    /// loop is never polled.
    fn scratch_state(name: &str) -> (AppState, rumqttc::EventLoop, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "relay-controller-host-{}-{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let (mqtt, eventloop) = AsyncClient::new(
            MqttOptions::new(format!("relay-test-{name}"), "127.0.0.1", 1883),
            1,
        );
        let state = AppState {
            bank: Arc::new(Mutex::new(RelayBank::default())),
            engine: Arc::new(Mutex::new(RelayEngine::new(
                EngineConfig::default(),
                RuleSet::default(),
            ))),
            timezone: Arc::new(Mutex::new("Asia/Kolkata".to_string())),
            store: RealtimeStore::File(FileStore::new(dir.join("store.json"))),
            config: ConfigStore::new(&dir),
            mqtt,
        };
        (state, eventloop, dir)
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    async fn serve(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        addr
    }

    #[test]
    fn validates_relay_names() {
        assert_eq!(validate_name("  Desk lamp  "), Some("Desk lamp"));
        assert_eq!(validate_name("   "), None);
        assert_eq!(validate_name(""), None);
        assert_eq!(validate_name(&"x".repeat(40)), Some("x".repeat(40).as_str()));
        assert_eq!(validate_name(&"x".repeat(41)), None);
        assert_eq!(validate_name(&format!("  {}  ", "é".repeat(40))).map(str::len), Some(80));
    }

    #[tokio::test]
    async fn sync_keeps_existing_records_with_odd_fields() {
        let (state, _eventloop, dir) = scratch_state("odd-fields");
        let stored = json!({"status": 1, "name": "Fan", "total_on_time": 5000});
        state.store.set("relays/relay1", &stored).await.unwrap();

        let mut bank = RelayBank::default();
        sync_bank(&state, &mut bank).await.unwrap();

        assert_eq!(state.store.get("relays/relay1").await.unwrap(), Some(stored));
        assert!(state.store.get("relays/relay2").await.unwrap().is_some());
        assert_eq!(bank.get(relay(1)).name, "Fan");
        assert_eq!(bank.get(relay(1)).total_on_time, 5000);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn control_tick_does_not_wait_on_a_stalled_broker() {
        let (state, _eventloop, dir) = scratch_state("stalled");
        while state
            .mqtt
            .try_publish("relays/test", QoS::AtMostOnce, false, "x")
            .is_ok()
        {}

        let mut record = RelayRecord::new(relay(1));
        record.switch(true, ist(8, 0, 0));
        state.store.save_relay(relay(1), &record).await.unwrap();
        state.engine.lock().await.set_rules(
            relay(1),
            RelayRules {
                auto_off_after_secs: Some(60),
                ..RelayRules::default()
            },
        );

        let tick = tokio::time::timeout(
            Duration::from_secs(2),
            run_control_tick(&state, ist(9, 0, 0)),
        )
        .await;
        assert!(matches!(tick, Ok(Ok(()))));

        let (bank, _) = state.store.load_bank().await.unwrap();
        assert!(!bank.get(relay(1)).status);
        assert_eq!(bank.get(relay(1)).total_on_time, 3_600);
        assert!(state.bank.try_lock().is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rules_put_persists_and_rejects_bad_input() {
        let (state, _eventloop, dir) = scratch_state("rules-put");
        let addr = serve(state.clone()).await;
        let client = http();
        let url = format!("http://{addr}/api/relays/relay1/rules");

        let response = client
            .put(&url)
            .json(&json!({
                "auto_off_after_secs": 0,
                "auto_on_after_secs": 30,
                "schedule": {"on": "07:00", "off": "99:99", "days": ["FRI", "MON", "FRI"]}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["auto_on_after_secs"], json!(30));
        assert_eq!(body["auto_off_after_secs"], Value::Null);
        assert_eq!(body["schedule"]["days"], json!(["MON", "FRI"]));

        let stored = state.store.load_rules().await.unwrap();
        assert_eq!(stored.get(relay(1)).auto_on_after_secs, Some(30));
        assert_eq!(stored.get(relay(1)).schedule.off, None);
        assert_eq!(
            state.engine.lock().await.rules().get(relay(1)),
            stored.get(relay(1))
        );

        let malformed = client
            .put(&url)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = malformed.json().await.unwrap();
        assert!(body["error"].is_string());

        let unknown = client
            .put(format!("http://{addr}/api/relays/relay9/rules"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn pir_put_sanitizes_and_persists() {
        let (state, _eventloop, dir) = scratch_state("pir-put");
        let addr = serve(state.clone()).await;

        let response = http()
            .put(format!("http://{addr}/api/pir"))
            .json(&json!({"enabled": true, "relays": ["relay2", "relay2", "relay7"], "hold_secs": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let expected = PirSettings {
            enabled: true,
            relays: vec![relay(2)],
            hold_secs: 5,
        };
        assert_eq!(state.store.load_pir_settings().await.unwrap(), expected);
        assert_eq!(state.engine.lock().await.rules().pir, expected);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn name_put_trims_and_validates() {
        let (state, _eventloop, dir) = scratch_state("name-put");
        let addr = serve(state.clone()).await;
        let client = http();
        let url = format!("http://{addr}/api/relays/relay3/name");

        let blank = client
            .put(&url)
            .json(&json!({"name": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(blank.status(), reqwest::StatusCode::BAD_REQUEST);

        let renamed = client
            .put(&url)
            .json(&json!({"name": "  Desk  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(renamed.status(), reqwest::StatusCode::OK);
        assert_eq!(
            state.store.get("relays/relay3/name").await.unwrap(),
            Some(json!("Desk"))
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn parses_power_commands() {
        assert_eq!(PowerCommand::parse(" ON "), Some(PowerCommand::On));
        assert_eq!(PowerCommand::parse("0"), Some(PowerCommand::Off));
        assert_eq!(PowerCommand::parse("Toggle"), Some(PowerCommand::Toggle));
        assert_eq!(PowerCommand::parse("dim"), None);

        assert!(PowerCommand::Toggle.resolve(false));
        assert!(!PowerCommand::Toggle.resolve(true));
        assert!(PowerCommand::On.resolve(true));
    }

    #[test]
    fn parses_motion_payloads() {
        assert_eq!(parse_motion("1"), Some(true));
        assert_eq!(parse_motion("Motion"), Some(true));
        assert_eq!(parse_motion("clear\n"), Some(false));
        assert_eq!(parse_motion("maybe"), None);
    }

    #[test]
    fn resolves_configured_timezone() {
        let now = now_in_timezone("Asia/Kolkata").unwrap();
        assert_eq!(now.offset().local_minus_utc(), 5 * 3600 + 1800);
        assert!(now_in_timezone("Mars/Olympus").is_none());
    }
}
