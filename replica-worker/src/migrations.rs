use replica_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{
    Executor,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::info;

/// Number of database connections to use for the migration pool.
const NUM_POOL_CONNECTIONS: u32 = 1;

/// Creates the `replica` schema and its tables in the database of `connection_config`.
///
/// The sqlx migration metadata lives in the `replica` schema too, so the public schema of
/// the destination stays untouched.
pub async fn migrate_replica_schema(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let options: PgConnectOptions = connection_config.with_db();

    let pool = PgPoolOptions::new()
        .max_connections(NUM_POOL_CONNECTIONS)
        .min_connections(NUM_POOL_CONNECTIONS)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists replica;").await?;
                conn.execute("set search_path = 'replica';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!(
        host = %connection_config.host,
        dbname = %connection_config.name,
        "applying migrations of the replica schema"
    );

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("migrations successfully applied");

    Ok(())
}
