use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use relay_common::{
    tree, PirSettings, RelayBank, RelayId, RelayRecord, RelayRules, RuleSet, StoreBackend,
    StoreConfig,
};
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

const RELAYS_PATH: &str = "relays";
const RULES_PATH: &str = "rules";
const PIR_SETTINGS_PATH: &str = "pir_settings";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store returned {status} for `{path}`")]
    Status { status: StatusCode, path: String },
    #[error("store file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store document: {0}")]
    Json(#[from] serde_json::Error),
}

/// The realtime key/value tree holding relay state, rules and PIR settings.
#[derive(Clone)]
pub enum RealtimeStore {
    Firebase(FirebaseStore),
    File(FileStore),
}

impl RealtimeStore {
    pub fn open(config: &StoreConfig, data_dir: &Path) -> Result<Self, StoreError> {
        match config.backend {
            StoreBackend::Firebase => Ok(Self::Firebase(FirebaseStore::new(config)?)),
            StoreBackend::File => Ok(Self::File(FileStore::new(data_dir.join("store.json")))),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Firebase(store) => format!("firebase {}", store.base_url),
            Self::File(store) => format!("file {}", store.path.display()),
        }
    }

    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Firebase(_) => StoreBackend::Firebase,
            Self::File(_) => StoreBackend::File,
        }
    }

    pub async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        match self {
            Self::Firebase(store) => store.get(path).await,
            Self::File(store) => store.get(path).await,
        }
    }

    pub async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        match self {
            Self::Firebase(store) => store.set(path, value).await,
            Self::File(store) => store.set(path, value).await,
        }
    }

    pub async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        match self {
            Self::Firebase(store) => store.update(path, fields).await,
            Self::File(store) => store.update(path, fields).await,
        }
    }

    /// Reads all relays; the ids that had to be defaulted are returned too.
    pub async fn load_bank(&self) -> Result<(RelayBank, Vec<RelayId>), StoreError> {
        let relays = self.get(RELAYS_PATH).await?;
        Ok(RelayBank::from_tree(relays.as_ref()))
    }

    pub async fn save_relay(&self, id: RelayId, record: &RelayRecord) -> Result<(), StoreError> {
        self.set(&relay_path(id), &serde_json::to_value(record)?).await
    }

    pub async fn rename_relay(&self, id: RelayId, name: &str) -> Result<(), StoreError> {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(name.to_string()));
        self.update(&relay_path(id), fields).await
    }

    pub async fn load_rules(&self) -> Result<RuleSet, StoreError> {
        let rules = self.get(RULES_PATH).await?;
        let pir = self.get(PIR_SETTINGS_PATH).await?;
        Ok(RuleSet::from_tree(rules.as_ref(), pir.as_ref()))
    }

    pub async fn save_rules(&self, id: RelayId, rules: &RelayRules) -> Result<(), StoreError> {
        self.set(&format!("{RULES_PATH}/{id}"), &serde_json::to_value(rules)?)
            .await
    }

    pub async fn load_pir_settings(&self) -> Result<PirSettings, StoreError> {
        let pir = self.get(PIR_SETTINGS_PATH).await?;
        Ok(PirSettings::from_value(pir.as_ref()))
    }

    pub async fn save_pir_settings(&self, settings: &PirSettings) -> Result<(), StoreError> {
        self.set(PIR_SETTINGS_PATH, &serde_json::to_value(settings)?).await
    }
}

fn relay_path(id: RelayId) -> String {
    format!("{RELAYS_PATH}/{id}")
}

/// Firebase Realtime Database through its REST surface.
#[derive(Clone)]
pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: Arc<str>,
    auth_token: Option<Arc<str>>,
}

impl FirebaseStore {
    fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        let auth_token = Some(config.auth_token.trim())
            .filter(|token| !token.is_empty())
            .map(Arc::from);

        Ok(Self {
            client,
            base_url: Arc::from(config.database_url.as_str()),
            auth_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}.json", self.base_url, path.trim_matches('/'));
        let request = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => request.query(&[("auth", &**token)]),
            None => request,
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let response = self.request(Method::GET, path).send().await?;
        let value: Value = check_status(response, path)?.json().await?;
        Ok(Some(value).filter(|value| !value.is_null()))
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let response = self
            .request(Method::PUT, path)
            .query(&[("print", "silent")])
            .json(value)
            .send()
            .await?;
        check_status(response, path)?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let response = self
            .request(Method::PATCH, path)
            .query(&[("print", "silent")])
            .json(&fields)
            .send()
            .await?;
        check_status(response, path)?;
        Ok(())
    }
}

fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StoreError::Status {
            status,
            path: path.to_string(),
        })
    }
}

/// Local stand-in for the hosted store: the whole tree in one JSON file.
/// The tree is cached after the first read, so the file is only meant to be
/// written by this process.
#[derive(Clone)]
pub struct FileStore {
    path: Arc<PathBuf>,
    tree: Arc<Mutex<Option<Value>>>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            tree: Arc::new(Mutex::new(None)),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let mut guard = self.tree.lock().await;
        let root = self.loaded(&mut guard).await?;
        Ok(tree::get(root, path).cloned())
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        self.modify(|root| tree::set(root, path, value.clone())).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.modify(|root| tree::update(root, path, fields)).await
    }

    /// Applies `change` to a copy of the tree; the cache only takes the copy
    /// once it is on disk.
    async fn modify(&self, change: impl FnOnce(&mut Value)) -> Result<(), StoreError> {
        let mut guard = self.tree.lock().await;
        let mut next = self.loaded(&mut guard).await?.clone();
        change(&mut next);
        self.persist(&next).await?;
        *guard = Some(next);
        Ok(())
    }

    async fn loaded<'a>(&self, slot: &'a mut Option<Value>) -> Result<&'a mut Value, StoreError> {
        let root = match slot.take() {
            Some(root) => root,
            None => self.read().await?,
        };
        Ok(slot.insert(root))
    }

    async fn read(&self) -> Result<Value, StoreError> {
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(Value::Object(Map::new())),
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, root: &Value) -> Result<(), StoreError> {
        let path = self.path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(root)?).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}
