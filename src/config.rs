//! Configuration module for mailgate.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [store]
//! backend = "redis"
//!
//! [gateway]
//! kind = "http"
//! url = "${MAIL_RELAY_URL}"
//!
//! [subscription]
//! web_app_domain = "app.example.com"
//! sending_address = "hello@example.com"
//! ```

use deadpool_redis::{Pool, Runtime};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consumer::BatchConsumer;
use crate::gateway::{EmailGateway, HttpGateway, LogGateway};
use crate::handlers::HandlerSet;
use crate::identity::{IdentityStore, InMemoryIdentityStore, RedisIdentityStore};
use crate::publisher::{RedisTaskPublisher, VerificationNotifier};
use crate::queue::{QueueError, QueueTransport, RedisStreamQueue};
use crate::router::Router;
use crate::store::{InMemorySuppressionStore, RedisSuppressionStore, SuppressionStore};
use crate::subscription::SubscriptionService;
use crate::template::{TemplateError, TemplateRegistry};
use crate::{DEFAULT_CONSUMER_GROUP, EVENT_STREAM_NAME};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Failed to create Redis pool: {0}")]
    Redis(String),

    #[error("Failed to load templates: {0}")]
    Templates(#[from] TemplateError),

    #[error("Failed to prepare the event stream: {0}")]
    Queue(#[from] QueueError),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MailgateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub subscription: SubscriptionConfig,

    #[serde(default)]
    pub templates: TemplatesConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer key for the producer and admin endpoints
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long an empty read blocks
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Unacknowledged messages are redelivered after this long
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries before a message is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            stream: default_stream(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl WorkerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_stream() -> String {
    EVENT_STREAM_NAME.to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_block_ms() -> u64 {
    2000
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_deliveries() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Subscription store configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Log instead of sending
    #[default]
    Log,
    Http,
}

/// Mail gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub kind: GatewayKind,

    /// Relay endpoint, required for `http`
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: GatewayKind::default(),
            url: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    1
}

/// Verification mail settings
#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    #[serde(default = "default_web_app_domain")]
    pub web_app_domain: String,

    #[serde(default = "default_verification_path")]
    pub verification_path: String,

    /// Sender of verification mails
    #[serde(default = "default_sending_address")]
    pub sending_address: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            web_app_domain: default_web_app_domain(),
            verification_path: default_verification_path(),
            sending_address: default_sending_address(),
        }
    }
}

fn default_web_app_domain() -> String {
    "localhost:3000".to_string()
}

fn default_verification_path() -> String {
    "/verify-email-subscription".to_string()
}

fn default_sending_address() -> String {
    "no-reply@localhost".to_string()
}

/// Template sources, applied after the built-ins
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TemplatesConfig {
    /// Directory of `<name>.html` / `<name>.txt` files
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// name -> body
    #[serde(default)]
    pub inline: HashMap<String, String>,
}

impl MailgateConfig {
    /// Load configuration from the default path or MAILGATE_CONFIG env var,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("MAILGATE_CONFIG").unwrap_or_else(|_| "config/mailgate.toml".to_string());

        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!(
            store = ?config.store.backend,
            gateway = ?config.gateway.kind,
            stream = %config.worker.stream,
            inline_templates = config.templates.inline.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate TOML text after `${VAR}` substitution.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: MailgateConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// `REDIS_URL`, `PORT`, `MAILGATE_API_KEY` and `MAILGATE_WORKER_NAME`
    /// win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(key) = lookup("MAILGATE_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(name) = lookup("MAILGATE_WORKER_NAME") {
            self.worker.name = Some(name);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(port = %port, "Ignoring invalid PORT"),
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.kind == GatewayKind::Http {
            let url = self.gateway.url.as_deref().unwrap_or_default();
            if url.is_empty() {
                return Err(ConfigError::ValidationError(
                    "gateway.url is required when gateway.kind = \"http\"".to_string(),
                ));
            }

            if url.contains("${") {
                return Err(ConfigError::ValidationError(format!(
                    "gateway.url contains an unsubstituted environment variable: {}",
                    url
                )));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(
                    "gateway.url must start with http:// or https://".to_string(),
                ));
            }
        }

        if self.worker.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.batch_size must be at least 1".to_string(),
            ));
        }

        if self.worker.max_deliveries == 0 {
            return Err(ConfigError::ValidationError(
                "worker.max_deliveries must be at least 1".to_string(),
            ));
        }

        if self.subscription.web_app_domain.is_empty() {
            return Err(ConfigError::ValidationError(
                "subscription.web_app_domain must not be empty".to_string(),
            ));
        }

        if !self.subscription.verification_path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "subscription.verification_path must start with '/'".to_string(),
            ));
        }

        Ok(())
    }

    /// In-memory stores live inside one process, so with the `memory`
    /// backend the server consumes the stream itself.
    pub fn runs_embedded_consumer(&self) -> bool {
        self.store.backend == StoreBackend::Memory
    }

    /// A standalone worker needs stores it shares with the server.
    pub fn check_standalone_worker(&self) -> Result<(), ConfigError> {
        if self.runs_embedded_consumer() {
            return Err(ConfigError::ValidationError(
                "store.backend = \"memory\" is not shared between processes; \
                 run the server alone (it consumes the stream itself) or use the redis backend"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Worker name from config, else hostname, else a UUID.
    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.worker.name {
            return name.clone();
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("worker-{}", name);
            }
        }

        format!("worker-{}", uuid::Uuid::new_v4())
    }
}

/// Collaborators shared by the server and the worker.
pub struct Components {
    pub pool: Pool,
    pub store: Arc<dyn SuppressionStore>,
    pub identity: Arc<dyn IdentityStore>,
    pub publisher: Arc<RedisTaskPublisher>,
    pub subscriptions: Arc<SubscriptionService>,
}

impl MailgateConfig {
    /// Build the Redis pool and every collaborator from the configuration.
    ///
    /// The event stream always lives in Redis; `store.backend = "memory"`
    /// only swaps the subscription and identity stores, and only works with
    /// the consumer embedded in the server (see
    /// [`MailgateConfig::runs_embedded_consumer`]).
    pub fn build_components(&self) -> Result<Components, ConfigError> {
        let pool = deadpool_redis::Config::from_url(self.redis.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConfigError::Redis(e.to_string()))?;

        let (store, identity): (Arc<dyn SuppressionStore>, Arc<dyn IdentityStore>) = match self.store.backend {
            StoreBackend::Redis => (
                Arc::new(RedisSuppressionStore::new(pool.clone())),
                Arc::new(RedisIdentityStore::new(pool.clone())),
            ),
            StoreBackend::Memory => {
                warn!("Using in-memory subscription store; data is lost on restart");
                (
                    Arc::new(InMemorySuppressionStore::new()),
                    Arc::new(InMemoryIdentityStore::new()),
                )
            }
        };

        let publisher = Arc::new(RedisTaskPublisher::new(pool.clone(), &self.worker.stream));
        let notifier = VerificationNotifier::new(
            publisher.clone(),
            &self.subscription.web_app_domain,
            &self.subscription.verification_path,
            &self.subscription.sending_address,
        );

        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            self.build_gateway()?,
            Arc::new(self.build_templates()?),
            notifier,
        ));

        Ok(Components {
            pool,
            store,
            identity,
            publisher,
            subscriptions,
        })
    }

    /// An `http` gateway without a usable URL is an error; mail is never
    /// silently diverted to the log gateway.
    pub fn build_gateway(&self) -> Result<Arc<dyn EmailGateway>, ConfigError> {
        let gateway = &self.gateway;
        match (gateway.kind, gateway.url.as_deref()) {
            (GatewayKind::Http, Some(url)) if !url.is_empty() && !url.contains("${") => {
                let mut http = HttpGateway::new(url)
                    .with_timeout(Duration::from_millis(gateway.timeout_ms))
                    .with_retries(gateway.retries);
                if let Some(key) = &gateway.api_key {
                    http = http.with_api_key(key);
                }
                info!(url = %url, "Using HTTP mail gateway");
                Ok(Arc::new(http))
            }
            (GatewayKind::Http, url) => Err(ConfigError::ValidationError(format!(
                "gateway.url is not usable for the http gateway: {:?}",
                url
            ))),
            (GatewayKind::Log, _) => Ok(Arc::new(LogGateway::new())),
        }
    }

    /// Built-ins, then the template directory, then inline templates.
    pub fn build_templates(&self) -> Result<TemplateRegistry, ConfigError> {
        let mut registry = TemplateRegistry::with_builtins();

        if let Some(dir) = &self.templates.dir {
            registry.load_dir(dir)?;
        }
        for (name, body) in &self.templates.inline {
            registry.insert(name.clone(), body.clone());
        }

        Ok(registry)
    }
}

impl Components {
    /// Consumer-group transport and batch consumer over these collaborators.
    pub async fn stream_consumer(
        &self,
        config: &MailgateConfig,
        consumer_name: &str,
    ) -> Result<BatchConsumer, ConfigError> {
        let worker = &config.worker;
        let queue = RedisStreamQueue::new(self.pool.clone(), &worker.stream, &worker.consumer_group, consumer_name)
            .with_block(worker.block())
            .with_visibility_timeout(worker.visibility_timeout())
            .with_max_deliveries(worker.max_deliveries);
        queue.ensure_group().await?;
        info!(dlq = %queue.dead_letter_queue().stream(), "Dead-letter stream ready");

        Ok(self.batch_consumer(Arc::new(queue), worker.batch_size))
    }

    /// Batch consumer dispatching to handlers over these collaborators.
    pub fn batch_consumer(&self, queue: Arc<dyn QueueTransport>, batch_size: usize) -> BatchConsumer {
        let handlers = HandlerSet::new(self.subscriptions.clone(), self.identity.clone());
        BatchConsumer::new(Arc::new(Router::new(handlers)), queue).with_batch_size(batch_size)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    substitute_with(content, |name| env::var(name).ok())
}

fn substitute_with(content: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match lookup(var_name) {
            Some(value) => value,
            None => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
