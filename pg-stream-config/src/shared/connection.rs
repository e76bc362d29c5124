use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::shared::ValidationError;

/// Default Postgres port.
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Session settings applied to every connection opened by the connector.
///
/// They pin the text representation of dates, intervals and floats so snapshot rows and wal2json
/// output render values the same way regardless of server defaults.
pub struct DefaultPgConnectionOptions;

impl DefaultPgConnectionOptions {
    const SETTINGS: &'static [(&'static str, &'static str)] = &[
        ("datestyle", "ISO"),
        ("intervalstyle", "postgres"),
        ("extra_float_digits", "3"),
        ("client_encoding", "UTF8"),
        ("application_name", "pg_stream"),
    ];

    /// Renders the settings as a `-c key=value` list for the `options` startup parameter.
    pub fn to_options_string() -> String {
        Self::SETTINGS
            .iter()
            .map(|(key, value)| format!("-c {key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Transport security towards the source database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Encrypt the connection without verifying the server certificate.
    Require,
    /// Plain TCP.
    #[default]
    None,
}

/// Connection identity of the source database.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Redacted in `Debug` output.
    #[serde(default)]
    pub password: Option<SecretString>,
    pub database: String,
    #[serde(default)]
    pub tls: TlsMode,
}

fn default_port() -> u16 {
    DEFAULT_PG_PORT
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyField("source.host"));
        }
        if self.user.trim().is_empty() {
            return Err(ValidationError::EmptyField("source.user"));
        }
        if self.database.trim().is_empty() {
            return Err(ValidationError::EmptyField("source.database"));
        }

        Ok(())
    }
}

/// Converts [`PgConnectionConfig`] into client specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Options targeting the server without selecting a database.
    fn without_db(&self) -> Output;

    /// Options targeting [`PgConnectionConfig::database`].
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> TokioPgConnectOptions {
        // The TLS handshake itself is driven by the connector passed to `connect`, the mode only
        // tells tokio-postgres whether to request it.
        let ssl_mode = match self.tls {
            TlsMode::Require => TokioPgSslMode::Require,
            TlsMode::None => TokioPgSslMode::Disable,
        };

        let mut config = TokioPgConnectOptions::new();
        config
            .host(self.host.clone())
            .port(self.port)
            .user(self.user.clone())
            .options(DefaultPgConnectionOptions::to_options_string())
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }

    fn with_db(&self) -> TokioPgConnectOptions {
        let mut config: TokioPgConnectOptions = self.without_db();
        config.dbname(self.database.clone());
        config
    }
}
