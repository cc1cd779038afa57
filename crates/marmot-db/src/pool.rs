//! Connects and migrates the backing store. Mirrors the teacher's
//! `cloud-component-service::db` module almost verbatim: separate
//! connect/migrate functions per backend, selected by matching on
//! `DbConfig` once at bootstrap.

use marmot_common::config::{DbConfig, DbPostgresConfig, DbSqliteConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, Executor, PgConnection, PgPool, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub enum DbPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub async fn connect(config: &DbConfig) -> Result<Arc<DbPool>, sqlx::Error> {
        match config {
            DbConfig::Postgres(c) => Ok(Arc::new(DbPool::Postgres(create_postgres_pool(c).await?))),
            DbConfig::Sqlite(c) => Ok(Arc::new(DbPool::Sqlite(create_sqlite_pool(c).await?))),
        }
    }

    pub fn as_postgres(&self) -> Option<&PgPool> {
        match self {
            DbPool::Postgres(pool) => Some(pool),
            DbPool::Sqlite(_) => None,
        }
    }

    pub fn as_sqlite(&self) -> Option<&SqlitePool> {
        match self {
            DbPool::Sqlite(pool) => Some(pool),
            DbPool::Postgres(_) => None,
        }
    }

    pub fn is_postgres(&self) -> bool {
        matches!(self, DbPool::Postgres(_))
    }
}

impl From<&DbPostgresConfig> for PgConnectOptions {
    fn from(config: &DbPostgresConfig) -> Self {
        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
    }
}

impl From<&DbSqliteConfig> for SqliteConnectOptions {
    fn from(config: &DbSqliteConfig) -> Self {
        SqliteConnectOptions::new()
            .filename(std::path::Path::new(&config.database))
            .create_if_missing(true)
    }
}

pub async fn create_postgres_pool(config: &DbPostgresConfig) -> Result<PgPool, sqlx::Error> {
    info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        schema = %config.schema,
        "connecting to postgres"
    );
    let conn_options = PgConnectOptions::from(config);
    let schema = config.schema.clone();
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                conn.execute(sqlx::query(&format!("SET search_path TO {schema}")))
                    .await?;
                Ok(())
            })
        })
        .connect_with(conn_options)
        .await
}

pub async fn postgres_migrate(config: &DbPostgresConfig) -> Result<(), sqlx::Error> {
    info!(schema = %config.schema, "running postgres migrations");
    let conn_options = PgConnectOptions::from(config);
    let mut conn = PgConnection::connect_with(&conn_options).await?;
    conn.execute(sqlx::query(&format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        config.schema
    )))
    .await?;
    conn.execute(sqlx::query(&format!("SET search_path TO {}", config.schema)))
        .await?;
    sqlx::migrate!("./migrations/postgres").run(&mut conn).await?;
    conn.close().await?;
    Ok(())
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<SqlitePool, sqlx::Error> {
    info!(database = %config.database, "connecting to sqlite");
    let conn_options = SqliteConnectOptions::from(config);
    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await
}

pub async fn sqlite_migrate(config: &DbSqliteConfig) -> Result<(), sqlx::Error> {
    info!(database = %config.database, "running sqlite migrations");
    let conn_options = SqliteConnectOptions::from(config);
    let mut conn = SqliteConnection::connect_with(&conn_options).await?;
    sqlx::migrate!("./migrations/sqlite").run(&mut conn).await?;
    conn.close().await?;
    Ok(())
}

pub async fn migrate(config: &DbConfig) -> Result<(), sqlx::Error> {
    match config {
        DbConfig::Postgres(c) => postgres_migrate(c).await,
        DbConfig::Sqlite(c) => sqlite_migrate(c).await,
    }
}
