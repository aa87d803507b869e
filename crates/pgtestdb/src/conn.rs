//! Connection factory
//!
//! Thin wrapper over a single `sqlx` Postgres connection. Connections run in
//! autocommit mode (no implicit transaction), which `CREATE DATABASE`,
//! `DROP DATABASE` and `ALTER DATABASE ... IS_TEMPLATE` require.

use std::time::Duration;

use sqlx::postgres::PgRow;
use sqlx::{Connection as _, FromRow, PgConnection};
use tracing::instrument;

use crate::config::{redact_url, ServerConfig};
use crate::{sql, Error, Result};

/// Attempts made by [`AdminConn::drop_database`] while sessions linger.
const DROP_ATTEMPTS: u32 = 6;

/// Delay before the first retry; doubles on each attempt.
const DROP_BACKOFF: Duration = Duration::from_millis(50);

/// A dedicated connection to one database.
///
/// The socket is closed when the value is dropped; [`DbConn::close`] does the
/// same but waits for the server to acknowledge the termination.
#[derive(Debug)]
pub struct DbConn {
    conn: PgConnection,
    url: String,
}

impl DbConn {
    /// Opens a connection to `url`.
    #[instrument(name = "pgtestdb.conn.connect", skip_all, fields(url = %redact_url(url)), err)]
    pub async fn connect(url: &str) -> Result<Self> {
        let conn = PgConnection::connect(url)
            .await
            .map_err(|source| Error::Connect {
                url: redact_url(url),
                source,
            })?;
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    /// URL this connection was opened with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Executes one or more statements without parameters.
    ///
    /// Uses the simple query protocol, so a migration may pass a whole
    /// script separated by semicolons.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.execute_masked(sql, sql).await
    }

    /// Like [`DbConn::execute`], reporting `shown` instead of the SQL text on
    /// failure. Used for statements that embed secrets.
    pub(crate) async fn execute_masked(&mut self, sql: &str, shown: &str) -> Result<u64> {
        tracing::debug!(statement = shown, "execute");
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql))
            .await
            .map(|done| done.rows_affected())
            .map_err(|source| Error::Statement {
                statement: shown.to_string(),
                source,
            })
    }

    /// Runs a query with text parameters bound as `$1, $2, ...`.
    pub async fn fetch_all(&mut self, sql: &str, params: &[&str]) -> Result<Vec<PgRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|source| Error::Statement {
                statement: sql.to_string(),
                source,
            })
    }

    /// Runs a `SELECT EXISTS (...)` style query with one bound parameter.
    pub async fn fetch_exists(&mut self, sql: &str, param: &str) -> Result<bool> {
        let row: Option<(bool,)> = self.fetch_optional(sql, param).await?;
        Ok(row.is_some_and(|(exists,)| exists))
    }

    /// Runs a query returning at most one row, with one bound parameter.
    pub async fn fetch_optional<T>(&mut self, sql: &str, param: &str) -> Result<Option<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        sqlx::query_as::<_, T>(sql)
            .bind(param)
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|source| Error::Statement {
                statement: sql.to_string(),
                source,
            })
    }

    /// Closes the connection, waiting for the server to acknowledge.
    pub async fn close(self) -> Result<()> {
        let url = redact_url(&self.url);
        self.conn
            .close()
            .await
            .map_err(|source| Error::Connect { url, source })
    }
}

impl std::ops::Deref for DbConn {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for DbConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Catalog facts about one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseState {
    pub is_template: bool,
    pub owner: String,
}

/// An administrative connection, remembering the server it belongs to.
///
/// Template and clone operations need the server coordinates to hand out
/// endpoints for the databases they create.
#[derive(Debug)]
pub struct AdminConn {
    conn: DbConn,
    config: ServerConfig,
}

impl AdminConn {
    /// Connects to the administrative database described by `config`.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let conn = DbConn::connect(&config.admin_url()).await?;
        Ok(Self {
            conn,
            config: config.clone(),
        })
    }

    /// Server this connection points at.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await
    }

    pub async fn role_exists(&mut self, role: &str) -> Result<bool> {
        self.conn.fetch_exists(sql::ROLE_EXISTS, role).await
    }

    pub async fn database_exists(&mut self, name: &str) -> Result<bool> {
        self.conn.fetch_exists(sql::DATABASE_EXISTS, name).await
    }

    /// `None` if the database is absent, else whether it is flagged as a template.
    pub async fn template_flag(&mut self, name: &str) -> Result<Option<bool>> {
        Ok(self
            .database_state(name)
            .await?
            .map(|state| state.is_template))
    }

    /// Template flag and owning role of `name`, if it exists.
    pub async fn database_state(&mut self, name: &str) -> Result<Option<DatabaseState>> {
        let row: Option<(bool, String)> = self.conn.fetch_optional(sql::DATABASE_STATE, name).await?;
        Ok(row.map(|(is_template, owner)| DatabaseState { is_template, owner }))
    }

    /// Drops `name` if it exists.
    ///
    /// Sessions closed just before the call may still be registered on the
    /// server, which rejects the drop as "in use"; that case is retried with
    /// backoff before the error is returned.
    #[instrument(name = "pgtestdb.database.drop", skip(self), err)]
    pub async fn drop_database(&mut self, name: &str) -> Result<()> {
        let statement = sql::drop_database(name);
        let mut delay = DROP_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.conn.execute(&statement).await {
                Ok(_) => return Ok(()),
                Err(err)
                    if attempt < DROP_ATTEMPTS
                        && err.sqlstate().as_deref() == Some(sql::OBJECT_IN_USE) =>
                {
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "database in use, retrying drop");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::ops::Deref for AdminConn {
    type Target = DbConn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for AdminConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
