//! Environment-driven configuration structures shared by all pipelines.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{InvalidQos, QualityOfService};
use crate::summary::{BrokerSummary, ConfigSummary, TraceSummary};

/// Default location of the persisted block cursor.
pub const DEFAULT_CURSOR_PATH: &str = ".BlockHeight";

const SKIP_DOTENV_VAR: &str = "CHAIN_NOTIFY_SKIP_DOTENV";
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Which broker connection a section of variables configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    Subscribe,
    Publish,
}

impl BrokerRole {
    fn env_prefix(self) -> &'static str {
        match self {
            Self::Subscribe => "NOTIFY_SUBSCRIBE_",
            Self::Publish => "NOTIFY_PUBLISH_",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Subscribe => "Subscribe",
            Self::Publish => "Publish",
        }
    }
}

/// Host and port of an MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    /// Accepts `tcp://host:port`, `mqtt://host:port` or bare `host[:port]`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpoint {
            value: raw.to_string(),
        };
        let rest = match raw.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some(_) => return Err(invalid()),
            None => raw,
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_MQTT_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Connection and naming settings for one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    role: BrokerRole,
    server: String,
    username: String,
    password: String,
    client_id: String,
    qos: QualityOfService,
    topic: Option<String>,
    prefix_topic: String,
}

impl BrokerConfig {
    /// Reads `NOTIFY_<ROLE>_*`, falling back to the supplied client id and
    /// topic when the corresponding variables are unset.
    pub fn load_from_env(
        role: BrokerRole,
        default_client_id: String,
        default_topic: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let prefix = role.env_prefix();
        let key = |name: &str| format!("{prefix}{name}");

        let server = get_required_var(&key("SERVER"))?;
        BrokerEndpoint::parse(&server)?;
        let qos = match get_optional_var(&key("QOS")) {
            Some(raw) => parse_qos(&key("QOS"), &raw)?,
            None => QualityOfService::AtLeastOnce,
        };

        Ok(Self {
            role,
            server,
            username: get_required_var(&key("USERNAME"))?,
            password: get_required_var(&key("PASSWORD"))?,
            client_id: get_optional_var(&key("CLIENT_ID")).unwrap_or(default_client_id),
            qos,
            topic: get_optional_var(&key("TOPIC")).or_else(|| default_topic.map(str::to_owned)),
            prefix_topic: get_optional_var(&key("PREFIX_TOPIC")).unwrap_or_default(),
        })
    }

    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.server)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn prefix_topic(&self) -> &str {
        &self.prefix_topic
    }

    /// Subscribing needs a topic to listen on.
    pub fn require_topic(&self) -> Result<&str, ConfigError> {
        self.topic().ok_or_else(|| ConfigError::MissingVar {
            key: format!("{}TOPIC", self.role.env_prefix()),
        })
    }

    pub fn summary(&self) -> BrokerSummary {
        BrokerSummary {
            section: self.role.label(),
            server: self.server.clone(),
            username: self.username.clone(),
            password: BrokerSummary::REDACTED,
            client_id: self.client_id.clone(),
            qos: self.qos.into(),
            topic: self.topic.clone(),
            prefix_topic: self.prefix_topic.clone(),
        }
    }
}

/// Values supplied on the command line that take precedence over the
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerOverrides {
    pub rpc_url: Option<String>,
    pub delay: Option<u64>,
}

/// Ledger endpoint plus the confirmation delay applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    rpc_url: String,
    delay: u64,
}

impl LedgerConfig {
    fn load_from_env(overrides: &LedgerOverrides) -> Result<Self, ConfigError> {
        let rpc_url = match &overrides.rpc_url {
            Some(url) => url.clone(),
            None => get_required_var("NOTIFY_RPC_URL")?,
        };
        Ok(Self {
            rpc_url,
            delay: load_delay(overrides)?,
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Confirmation delay `N` in blocks.
    pub fn delay(&self) -> u64 {
        self.delay
    }

    /// Depth announced for records confirmed under this delay.
    pub fn confirmation_depth(&self) -> u64 {
        self.delay + 1
    }
}

/// Settings forwarded to `debug_traceTransaction`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceConfig {
    enabled: bool,
    timeout_secs: Option<u64>,
    reexec: Option<u64>,
}

impl TraceConfig {
    pub fn new(enabled: bool, timeout_secs: Option<u64>, reexec: Option<u64>) -> Self {
        Self {
            enabled,
            timeout_secs: timeout_secs.filter(|secs| *secs > 0),
            reexec: reexec.filter(|depth| *depth > 0),
        }
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let enabled = match get_optional_var("NOTIFY_ENABLE_TRACER") {
            Some(raw) => parse_bool("NOTIFY_ENABLE_TRACER", &raw)?,
            None => false,
        };
        Ok(Self::new(
            enabled,
            get_optional_number("NOTIFY_TRACER_TIMEOUT_SECS")?,
            get_optional_number("NOTIFY_TRACER_REEXEC")?,
        ))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Timeout in the duration syntax the node expects, e.g. `"5s"`.
    pub fn timeout(&self) -> Option<String> {
        self.timeout_secs.map(|secs| format!("{secs}s"))
    }

    pub fn reexec(&self) -> Option<u64> {
        self.reexec
    }

    fn summary(&self) -> TraceSummary {
        TraceSummary {
            enabled: self.enabled,
            timeout: self.timeout(),
            reexec: self.reexec,
        }
    }
}

/// Pending mode: raw transactions in, decoded records out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfig {
    subscribe: BrokerConfig,
    publish: BrokerConfig,
}

impl PendingConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            subscribe: BrokerConfig::load_from_env(
                BrokerRole::Subscribe,
                "NotifyPendingSubscribe".to_string(),
                Some("RawTransaction"),
            )?,
            publish: BrokerConfig::load_from_env(
                BrokerRole::Publish,
                "NotifyPendingPublish".to_string(),
                Some("Pending"),
            )?,
        })
    }

    pub fn subscribe(&self) -> &BrokerConfig {
        &self.subscribe
    }

    pub fn publish(&self) -> &BrokerConfig {
        &self.publish
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            mode: "pending",
            subscribe: Some(self.subscribe.summary()),
            publish: self.publish.summary(),
            rpc_url: None,
            delay: None,
            tracer: None,
            cursor_path: None,
        }
    }
}

/// Transfer mode: pending records in, confirmed records out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    subscribe: BrokerConfig,
    publish: BrokerConfig,
    ledger: LedgerConfig,
    cursor_path: Option<PathBuf>,
}

impl TransferConfig {
    pub fn load_from_env(overrides: &LedgerOverrides) -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let ledger = LedgerConfig::load_from_env(overrides)?;
        let depth = ledger.confirmation_depth();
        Ok(Self {
            subscribe: BrokerConfig::load_from_env(
                BrokerRole::Subscribe,
                format!("NotifyTransferSubscribe{depth}"),
                Some("Pending"),
            )?,
            publish: BrokerConfig::load_from_env(
                BrokerRole::Publish,
                format!("NotifyTransferPublish{depth}"),
                None,
            )?,
            ledger,
            cursor_path: get_optional_var("NOTIFY_CURSOR_PATH").map(PathBuf::from),
        })
    }

    pub fn subscribe(&self) -> &BrokerConfig {
        &self.subscribe
    }

    pub fn publish(&self) -> &BrokerConfig {
        &self.publish
    }

    pub fn ledger(&self) -> &LedgerConfig {
        &self.ledger
    }

    pub fn cursor_path(&self) -> Option<&PathBuf> {
        self.cursor_path.as_ref()
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            mode: "transfer",
            subscribe: Some(self.subscribe.summary()),
            publish: self.publish.summary(),
            rpc_url: Some(self.ledger.rpc_url.clone()),
            delay: Some(self.ledger.delay),
            tracer: None,
            cursor_path: self.cursor_path.as_ref().map(|p| p.display().to_string()),
        }
    }
}

/// Monitor mode: blocks in, classified records out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    publish: BrokerConfig,
    ledger: LedgerConfig,
    trace: TraceConfig,
    cursor_path: PathBuf,
}

impl MonitorConfig {
    pub fn load_from_env(overrides: &LedgerOverrides) -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let ledger = LedgerConfig::load_from_env(overrides)?;
        let publish = BrokerConfig::load_from_env(
            BrokerRole::Publish,
            format!("NotifyMonitorPublish{}", ledger.confirmation_depth()),
            None,
        )?;
        Ok(Self {
            publish,
            ledger,
            trace: TraceConfig::load_from_env()?,
            cursor_path: get_optional_var("NOTIFY_CURSOR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CURSOR_PATH)),
        })
    }

    pub fn publish(&self) -> &BrokerConfig {
        &self.publish
    }

    pub fn ledger(&self) -> &LedgerConfig {
        &self.ledger
    }

    pub fn trace(&self) -> &TraceConfig {
        &self.trace
    }

    pub fn cursor_path(&self) -> &PathBuf {
        &self.cursor_path
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            mode: "monitor",
            subscribe: None,
            publish: self.publish.summary(),
            rpc_url: Some(self.ledger.rpc_url.clone()),
            delay: Some(self.ledger.delay),
            tracer: Some(self.trace.summary()),
            cursor_path: Some(self.cursor_path.display().to_string()),
        }
    }
}

fn load_delay(overrides: &LedgerOverrides) -> Result<u64, ConfigError> {
    match overrides.delay {
        Some(delay) => Ok(delay),
        None => Ok(get_optional_number("NOTIFY_DELAY_BLOCK")?.unwrap_or(0)),
    }
}

fn parse_qos(key: &str, raw: &str) -> Result<QualityOfService, ConfigError> {
    let level: u8 = raw.parse().map_err(|source| ConfigError::InvalidNumber {
        key: key.to_string(),
        source,
    })?;
    QualityOfService::try_from(level).map_err(|source| ConfigError::InvalidQos {
        key: key.to_string(),
        source,
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn get_optional_number(key: &str) -> Result<Option<u64>, ConfigError> {
    get_optional_var(key)
        .map(|raw| {
            raw.parse().map_err(|source| ConfigError::InvalidNumber {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
}

fn get_required_var(key: &str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or_else(|| ConfigError::MissingVar {
        key: key.to_string(),
    })
}

fn get_optional_var(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os(SKIP_DOTENV_VAR).is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: String },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid quality of service in `{key}`: {source}")]
    InvalidQos {
        key: String,
        #[source]
        source: InvalidQos,
    },
    #[error("invalid boolean `{value}` in `{key}`")]
    InvalidBool { key: String, value: String },
    #[error("invalid broker endpoint `{value}`")]
    InvalidEndpoint { value: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
