//! Process configuration, loaded from the environment at startup.
//!
//! `AgentConfig` (the per-agent model/permission/resource profile from
//! spec.md §3) is persisted data owned by operators, not process config —
//! see [`crate::agent_config`].

use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub encryption_key: [u8; 32],
    pub jwt_secret: String,
    /// SHA-256 of the single operator-issued API key, hex-encoded in
    /// `AGENTBOX_API_KEY_HASH`. API-key issuance/storage is an external
    /// collaborator (spec.md §1); the process only verifies against this
    /// one configured hash.
    pub api_key_hash: Option<[u8; 32]>,
    pub container: ContainerConfig,
    pub pool: PoolConfig,
    pub gc: GcConfig,
    pub task_manager: TaskManagerConfig,
    pub batch: BatchConfig,
    pub webhook: WebhookConfig,
    pub cron: CronDefaults,
    pub channel_session: ChannelSessionConfig,
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub engine: ContainerEngineKind,
    pub default_image: String,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngineKind {
    Docker,
    Noop,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_key: usize,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub sweep_interval: Duration,
    pub max_container_age: Duration,
    pub max_stopped_age: Duration,
}

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_concurrent_tasks: usize,
    pub default_wall_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_concurrent_per_batch: usize,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub dispatch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CronDefaults {
    pub poll_interval: Duration,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct ChannelSessionConfig {
    pub ttl: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            engine: ContainerEngineKind::Docker,
            default_image: "agentbox/runner:latest".to_string(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 4,
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_container_age: Duration::from_secs(6 * 3600),
            max_stopped_age: Duration::from_secs(900),
        }
    }
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            default_wall_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_batch: 4,
            max_retries: 3,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for CronDefaults {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for ChannelSessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Loads configuration from the environment. Requires
    /// `AGENTBOX_ENCRYPTION_KEY` (32 raw bytes, hex-encoded) and
    /// `AGENTBOX_JWT_SECRET`; everything else has a usable default.
    pub fn load() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("AGENTBOX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("agentbox")
            });

        let bind_addr =
            std::env::var("AGENTBOX_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let key_hex = std::env::var("AGENTBOX_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::MissingEnv("AGENTBOX_ENCRYPTION_KEY".to_string()))?;
        let encryption_key = parse_key(&key_hex)?;

        let jwt_secret = std::env::var("AGENTBOX_JWT_SECRET")
            .map_err(|_| ConfigError::MissingEnv("AGENTBOX_JWT_SECRET".to_string()))?;
        if jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid {
                field: "AGENTBOX_JWT_SECRET".to_string(),
                reason: "must be at least 16 characters".to_string(),
            });
        }

        let api_key_hash = std::env::var("AGENTBOX_API_KEY_HASH")
            .ok()
            .map(|hex_str| parse_key_field("AGENTBOX_API_KEY_HASH", &hex_str))
            .transpose()?;

        let mut container = ContainerConfig::default();
        if let Ok(engine) = std::env::var("AGENTBOX_CONTAINER_ENGINE") {
            container.engine = match engine.as_str() {
                "docker" => ContainerEngineKind::Docker,
                "noop" => ContainerEngineKind::Noop,
                other => {
                    return Err(ConfigError::Invalid {
                        field: "AGENTBOX_CONTAINER_ENGINE".to_string(),
                        reason: format!("unknown engine '{other}', expected docker or noop"),
                    });
                }
            };
        }
        if let Ok(image) = std::env::var("AGENTBOX_DEFAULT_IMAGE") {
            container.default_image = image;
        }

        Ok(Self {
            data_dir,
            bind_addr,
            encryption_key,
            jwt_secret,
            api_key_hash,
            container,
            pool: PoolConfig::default(),
            gc: GcConfig::default(),
            task_manager: TaskManagerConfig::default(),
            batch: BatchConfig::default(),
            webhook: WebhookConfig::default(),
            cron: CronDefaults::default(),
            channel_session: ChannelSessionConfig::default(),
        })
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("agentbox.sqlite3")
    }
}

fn parse_key(hex_str: &str) -> Result<[u8; 32], ConfigError> {
    parse_key_field("AGENTBOX_ENCRYPTION_KEY", hex_str)
}

fn parse_key_field(field: &str, hex_str: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|_| ConfigError::Invalid {
        field: field.to_string(),
        reason: "not valid hex".to_string(),
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| ConfigError::Invalid {
        field: field.to_string(),
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}
