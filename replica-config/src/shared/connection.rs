use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use sqlx::postgres::{PgConnectOptions as SqlxConnectOptions, PgSslMode as SqlxSslMode};
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

/// Connection parameters for a Postgres database.
///
/// The same struct describes the source (queue provider), the destination and
/// the state store connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Name of the database.
    pub name: String,
    pub username: String,
    /// Redacted in debug output.
    #[serde(default, deserialize_with = "deserialize_password")]
    pub password: Option<SecretString>,
    /// Require an encrypted connection instead of preferring one.
    #[serde(default)]
    pub require_ssl: bool,
}

fn deserialize_password<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Converts a [`PgConnectionConfig`] into the connect options of a specific driver.
///
/// Both sqlx (state store, migrations) and tokio-postgres (queue, destination,
/// copy) connect with the same parameters.
pub trait IntoConnectOptions<Output> {
    /// Connect options without a database, for administrative statements.
    fn without_db(&self) -> Output;

    /// Connect options for [`PgConnectionConfig::name`].
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<SqlxConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> SqlxConnectOptions {
        let ssl_mode = if self.require_ssl {
            SqlxSslMode::Require
        } else {
            SqlxSslMode::Prefer
        };
        let options = SqlxConnectOptions::new_without_pgpass()
            .host(&self.host)
            .username(&self.username)
            .port(self.port)
            .ssl_mode(ssl_mode);

        match &self.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        }
    }

    fn with_db(&self) -> SqlxConnectOptions {
        let options: SqlxConnectOptions = self.without_db();
        options.database(&self.name)
    }
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> TokioPgConnectOptions {
        let ssl_mode = if self.require_ssl {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };
        let mut config = TokioPgConnectOptions::new();
        config
            .host(self.host.clone())
            .port(self.port)
            .user(self.username.clone())
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }

    fn with_db(&self) -> TokioPgConnectOptions {
        let mut options: TokioPgConnectOptions = self.without_db();
        options.dbname(self.name.clone());
        options
    }
}
