use anyhow::{anyhow, ensure, Context, Result};
use channel::ChannelConfig;
use client::ClientConfig;
use model::NodeAddr;
use query::QueryConfig;
use routing::RoutingConfig;
use serde::Deserialize;
use server::ServerConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Configuration of one node, read from a TOML file.
///
/// The `[channel]` and `[query]` sections apply to every component that
/// opens channels or runs queries, so `server.query` and
/// `client.channel` are taken from them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub logging: LoggingConfig,
    pub channel: ChannelConfig,
    pub server: ServerConfig,
    pub query: QueryConfig,
    pub routing: RoutingConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address the server listens on.
    pub bind: String,
    /// `host:port` other nodes and the partitioner know this node by.
    /// Defaults to the bound address.
    pub advertised: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7000".to_string(),
            advertised: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `geostream=debug,warn`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text).context("Could not parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.node.bind.is_empty(), "node.bind must not be empty");
        self.advertised()?;
        EnvFilter::try_new(&self.logging.level)
            .with_context(|| format!("Invalid logging.level '{}'", self.logging.level))?;

        let channel = &self.channel;
        ensure!(channel.max_in_flight_calls > 0, "channel.max_in_flight_calls must be positive");
        ensure!(channel.writer.batch_size > 0, "channel.writer.batch_size must be positive");
        ensure!(
            channel.writer.queue_capacity > 0,
            "channel.writer.queue_capacity must be positive"
        );
        ensure!(
            channel.maintenance_interval_ms > 0,
            "channel.maintenance_interval_ms must be positive"
        );
        ensure!(
            channel.maintenance_interval_ms < channel.keep_alive_interval_ms,
            "channel.maintenance_interval_ms ({}) must be below keep_alive_interval_ms ({})",
            channel.maintenance_interval_ms,
            channel.keep_alive_interval_ms
        );
        ensure!(
            channel.retry.backoff_factor >= 1.0,
            "channel.retry.backoff_factor must be at least 1"
        );

        let server = &self.server;
        ensure!(server.max_active_queries > 0, "server.max_active_queries must be positive");
        ensure!(
            server.maintenance_interval_ms > 0,
            "server.maintenance_interval_ms must be positive"
        );
        ensure!(server.writer.batch_size > 0, "server.writer.batch_size must be positive");
        ensure!(server.writer.queue_capacity > 0, "server.writer.queue_capacity must be positive");

        ensure!(
            self.query.result_queue_capacity > 0,
            "query.result_queue_capacity must be positive"
        );
        ensure!(self.query.snapshot_page_size > 0, "query.snapshot_page_size must be positive");
        ensure!(self.client.result_buffer > 0, "client.result_buffer must be positive");
        Ok(())
    }

    /// The configured advertised address, if any.
    pub fn advertised(&self) -> Result<Option<NodeAddr>> {
        self.node
            .advertised
            .as_deref()
            .map(|addr| {
                addr.parse::<NodeAddr>()
                    .map_err(|e| anyhow!("Invalid node.advertised '{addr}': {e}"))
            })
            .transpose()
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            query: self.query.clone(),
            ..self.server.clone()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            channel: self.channel.clone(),
            ..self.client.clone()
        }
    }
}
