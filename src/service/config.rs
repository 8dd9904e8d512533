extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{AppError, AppResult};

const ENV_PREFIX: &str = "MINIBROKER";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Longest quiet period between two decoded requests before the connection is dropped.
    pub conn_idle_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 9092,
            conn_idle_timeout_ms: 60 * 1000,
            read_buffer_size: 4 * 1024,
            max_frame_size: 1024 * 1024,
        }
    }
}

/// Per-connection processing limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound of handler tasks dispatched but not yet completed on one connection.
    pub max_in_flight: usize,
    /// Capacity of the read -> process and process -> write queues.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_in_flight: 64,
            channel_capacity: 64,
        }
    }
}

/// Immutable server configuration. Every way of building one goes through
/// [`ServerConfig::validate`], so a value in hand is always usable.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    network: NetworkConfig,
    pipeline: PipelineConfig,
    /// Exact idle timeout when built in code; files only carry whole milliseconds.
    #[serde(skip)]
    conn_idle_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16, conn_idle_timeout: Duration) -> AppResult<Self> {
        let config = ServerConfig {
            network: NetworkConfig {
                host: host.into(),
                port,
                conn_idle_timeout_ms: u64::try_from(conn_idle_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                ..NetworkConfig::default()
            },
            pipeline: PipelineConfig::default(),
            conn_idle_timeout: Some(conn_idle_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> AppResult<Self> {
        self.pipeline = pipeline;
        self.validate()?;
        Ok(self)
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> AppResult<Self> {
        self.network.max_frame_size = max_frame_size;
        self.validate()?;
        Ok(self)
    }

    /// Loads the configuration from a file, overlaid with `MINIBROKER__SECTION__KEY`
    /// environment variables.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.conn_idle_timeout().is_zero() {
            return Err(AppError::InvalidConfig(
                "conn_idle_timeout must be greater than 0".into(),
            ));
        }
        if self.network.host.is_empty() {
            return Err(AppError::InvalidConfig("host must not be empty".into()));
        }
        if self.network.read_buffer_size == 0 {
            return Err(AppError::InvalidConfig(
                "read_buffer_size must be greater than 0".into(),
            ));
        }
        if self.network.max_frame_size == 0 || self.network.max_frame_size > i32::MAX as usize {
            return Err(AppError::InvalidConfig(format!(
                "max_frame_size must be within 1..={}",
                i32::MAX
            )));
        }
        if self.pipeline.max_in_flight == 0 {
            return Err(AppError::InvalidConfig(
                "max_in_flight must be greater than 0".into(),
            ));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "channel_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.network.host
    }

    pub fn port(&self) -> u16 {
        self.network.port
    }

    pub fn listen_address(&self) -> String {
        if self.network.host.contains(':') {
            format!("[{}]:{}", self.network.host, self.network.port)
        } else {
            format!("{}:{}", self.network.host, self.network.port)
        }
    }

    pub fn conn_idle_timeout(&self) -> Duration {
        self.conn_idle_timeout
            .unwrap_or_else(|| Duration::from_millis(self.network.conn_idle_timeout_ms))
    }

    pub fn read_buffer_size(&self) -> usize {
        self.network.read_buffer_size
    }

    pub fn max_frame_size(&self) -> usize {
        self.network.max_frame_size
    }

    pub fn max_in_flight(&self) -> usize {
        self.pipeline.max_in_flight
    }

    pub fn channel_capacity(&self) -> usize {
        self.pipeline.channel_capacity
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }
}
