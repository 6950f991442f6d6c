use replica::error::ReplicaResult;
use replica_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{Client, Config, Connection, NoTls, Socket};
use tracing::{Instrument, error, info};

use crate::error::sqlx_error;

/// Drives `connection` in a background task until it terminates.
fn spawn_postgres_connection(connection: Connection<Socket, NoTlsStream>) {
    let span = tracing::Span::current();
    let task = async move {
        if let Err(err) = connection.await {
            error!("an error occurred during the Postgres connection: {err}");
            return;
        }

        info!("postgres connection terminated successfully");
    }
    .instrument(span);

    tokio::spawn(task);
}

/// Opens a [`tokio_postgres`] connection to the database of `config`.
pub async fn connect(config: &PgConnectionConfig) -> ReplicaResult<Client> {
    let pg_config: Config = config.with_db();
    let (client, connection) = pg_config.connect(NoTls).await?;
    spawn_postgres_connection(connection);

    info!(host = %config.host, dbname = %config.name, "connected to postgres");

    Ok(client)
}

/// Opens a [`sqlx`] pool to the database of `config`.
pub async fn connect_pool(config: &PgConnectionConfig, max_connections: u32) -> ReplicaResult<PgPool> {
    let options: PgConnectOptions = config.with_db();

    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(sqlx_error)
}
