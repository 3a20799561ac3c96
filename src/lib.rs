use config::{Config, ConfigError};
use serde::Deserialize;

pub mod application;
pub mod domain;
pub mod infrastructure;

#[derive(Clone, Debug, Deserialize)]
pub struct CrmConfig {
    pub eventstore: EventStore,
    pub meilisearch: MeiliSearch,
    pub logger: Logger,
    pub web: Web,
    pub repository: Repository,
    pub cache: Cache,
    pub id: IdSettings,
}

impl CrmConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(config::File::with_name("crm.toml").required(false))
            .add_source(config::Environment::with_prefix("CRM").separator("__"))
            .build()?
            .try_deserialize::<CrmConfig>()?
            .validate()
    }

    /// TOML文字列から設定を読み込む（未指定の項目は既定値）
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize::<CrmConfig>()?
            .validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        self.id.validate()?;
        Ok(self)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("eventstore.url", "esdb://localhost:2113?tls=false")?
            .set_default("meilisearch.url", "http://localhost:7700")?
            .set_default("meilisearch.api_key", "")?
            .set_default("logger.level", "INFO")?
            .set_default("web.address", "0.0.0.0:8080")?
            .set_default("repository.backend", "eventstore")?
            .set_default(
                "cache.names",
                vec![CUSTOMERS_CACHE.to_owned(), CUSTOMER_LIST_CACHE.to_owned()],
            )?
            .set_default("cache.clear_on_startup", false)?
            .set_default("id.machine_id", 1)?
            .set_default("id.node_id", 1)
    }
}

/// 顧客単体のキャッシュ名
pub const CUSTOMERS_CACHE: &str = "customers";
/// 顧客一覧のキャッシュ名
pub const CUSTOMER_LIST_CACHE: &str = "customer_list";

#[derive(Clone, Debug, Deserialize)]
pub struct EventStore {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MeiliSearch {
    pub url: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Logger {
    pub level: Level,
}

#[derive(Clone, Debug, Deserialize)]
pub enum Level {
    TRACE,
    DEBUG,
    INFO,
    WARN,
    ERROR,
}

impl From<&Level> for tracing::Level {
    fn from(value: &Level) -> Self {
        match value {
            Level::TRACE => tracing::Level::TRACE,
            Level::DEBUG => tracing::Level::DEBUG,
            Level::INFO => tracing::Level::INFO,
            Level::WARN => tracing::Level::WARN,
            Level::ERROR => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Web {
    pub address: String,
    pub tls: Option<Tls>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Repository {
    pub backend: Backend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    EventStore,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Cache {
    pub names: Vec<String>,
    pub clear_on_startup: bool,
}

/// Snowflake IDのマシンIDとノードID（それぞれ5ビット）
#[derive(Clone, Debug, Deserialize)]
pub struct IdSettings {
    pub machine_id: i32,
    pub node_id: i32,
}

impl IdSettings {
    pub const MAX_ID: i32 = 31;

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [("id.machine_id", self.machine_id), ("id.node_id", self.node_id)] {
            if !(0..=Self::MAX_ID).contains(&value) {
                return Err(ConfigError::Message(format!(
                    "{} must be between 0 and {}: {}",
                    key,
                    Self::MAX_ID,
                    value
                )));
            }
        }
        Ok(())
    }
}
