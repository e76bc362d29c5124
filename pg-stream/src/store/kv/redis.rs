use std::time::Duration;

use fred::prelude::{Client, ClientLike, KeysInterface, Server, ServerConfig};
use fred::types::Builder;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::store::kv::KeyValueStore;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Key-value store backed by a single Redis server.
///
/// The connection is not re-established when it drops: a failed write surfaces to the caller
/// instead of being retried in the background.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    client: Client,
}

impl RedisKeyValueStore {
    /// Connects and probes the server with `PING`. Fails without retrying when the server is
    /// unreachable or rejects the credentials.
    pub async fn connect(
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<SecretString>,
    ) -> CdcResult<Self> {
        let address = format!("{host}:{port}");

        let client = Builder::default_centralized()
            .with_config(|redis_config| {
                redis_config.username = username;
                redis_config.password = password.map(|p| p.expose_secret().to_owned());
                redis_config.server = ServerConfig::Centralized {
                    server: Server::new(host, port),
                };
            })
            .with_connection_config(|config| {
                config.connection_timeout = CONNECTION_TIMEOUT;
                config.internal_command_timeout = COMMAND_TIMEOUT;
                config.max_command_attempts = 1;
            })
            .with_performance_config(|config| {
                config.default_command_timeout = COMMAND_TIMEOUT;
            })
            .build()
            .map_err(|err| {
                cdc_error!(
                    ErrorKind::ConfigError,
                    "Invalid Redis configuration",
                    address.clone(),
                    source: err
                )
            })?;

        debug!(%address, "connecting to redis");
        client.init().await.map_err(|err| {
            cdc_error!(
                ErrorKind::CheckpointStoreConnectionFailed,
                "Redis connection failed",
                address.clone(),
                source: err
            )
        })?;

        client.ping::<()>(None).await.map_err(|err| {
            cdc_error!(
                ErrorKind::CheckpointStoreConnectionFailed,
                "Redis liveness probe failed",
                address.clone(),
                source: err
            )
        })?;
        info!(%address, "connected to redis checkpoint store");

        Ok(Self { client })
    }
}

impl std::fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValueStore")
            .field("connected", &self.client.is_connected())
            .finish()
    }
}

impl KeyValueStore for RedisKeyValueStore {
    async fn set(&self, key: &str, value: &str) -> CdcResult<()> {
        self.client
            .set::<(), _, _>(key, value, None, None, false)
            .await
            .map_err(|err| {
                cdc_error!(
                    ErrorKind::CheckpointWriteFailed,
                    "Redis write failed",
                    format!("SET {key}"),
                    source: err
                )
            })
    }

    async fn get(&self, key: &str) -> CdcResult<Option<String>> {
        self.client
            .get::<Option<String>, _>(key)
            .await
            .map_err(|err| {
                cdc_error!(
                    ErrorKind::CheckpointReadFailed,
                    "Redis read failed",
                    format!("GET {key}"),
                    source: err
                )
            })
    }

    async fn close(&self) -> CdcResult<()> {
        if !self.client.is_connected() {
            return Ok(());
        }

        self.client.quit().await.map_err(|err| {
            cdc_error!(
                ErrorKind::CheckpointStoreCloseFailed,
                "Redis connection could not be closed",
                source: err
            )
        })
    }
}
