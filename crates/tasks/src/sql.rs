//! SQL statements against the shared `sq.Db` connection.

use crate::{hand_back, runtime};
use async_trait::async_trait;
use serialq_core::{Completion, Config, ConfigError, Handle, Instance, Status, Task, TaskError, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// Attachment key under which `sq.Db` keeps its open connection.
pub const CONNECTION_KEY: &str = "connection";

/// Database path used when `sq.Db` is given none.
pub const DEFAULT_DB_PATH: &str = "sqlite::memory:";

/// `sq.Db` defaults.
pub(crate) fn db_defaults() -> Config {
    Config::new()
        .with("path", DEFAULT_DB_PATH)
        .with("maxConnections", 1)
}

/// Errors raised by a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SqlError {
    /// Opening the database failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// A statement failed
    #[error("{message}")]
    Statement {
        /// Database message
        message: String,
        /// Database error code, when the driver reports one
        code: Option<String>,
    },
}

/// An open database.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Run `stmt` with positional `args`, returning rows as JSON objects.
    async fn execute(
        &self,
        stmt: &str,
        args: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, SqlError>;
}

/// Opens connections from `sq.Db` options.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    /// Open a connection.
    async fn connect(&self, options: &Config) -> Result<Arc<dyn SqlConnection>, SqlError>;
}

#[derive(Clone)]
struct ConnectionHandle(Arc<dyn SqlConnection>);

/// Runs `stmt` on the connection held by the `db` instance.
///
/// `args` is either one argument list or, when its first entry is itself a
/// list, a batch of argument lists run in order. Failures of all but the last
/// batch entry are logged and otherwise ignored; the last entry decides the
/// status and its rows become the results. An empty `stmt` does nothing.
pub struct SqlTask {
    connector: Option<Arc<dyn SqlConnector>>,
}

impl SqlTask {
    /// Create the adapter. Without a connector every statement is a
    /// configuration error.
    pub fn new(connector: Option<Arc<dyn SqlConnector>>) -> Self {
        Self { connector }
    }
}

impl Task for SqlTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let stmt = config.str("stmt").unwrap_or_default().to_string();
        if stmt.is_empty() {
            debug!(task = %instance.id(), "empty statement");
            return done.delegate(instance);
        }
        let db = config
            .get("db")
            .and_then(Value::as_instance)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey("db".to_string()))?;
        let connector = self
            .connector
            .clone()
            .ok_or_else(|| TaskError::Other("no SQL connector configured".to_string()))?;
        let batch = batch(config.list("args").unwrap_or_default());
        let rt = runtime(instance)?;

        let instance = instance.clone();
        rt.spawn(async move {
            let conn = match connection(&db, connector.as_ref()).await {
                Ok(conn) => conn,
                Err(err) => {
                    error!(task = %instance.id(), error = %err, "could not open database");
                    instance.set_status(Status::Failure);
                    hand_back(&instance, done);
                    return;
                }
            };

            let Some((last, rest)) = batch.split_last() else {
                hand_back(&instance, done);
                return;
            };
            for args in rest {
                if let Err(err) = conn.execute(&stmt, args).await {
                    log_failure(&instance, &err);
                }
            }
            match conn.execute(&stmt, last).await {
                Ok(rows) => {
                    debug!(task = %instance.id(), rows = rows.len(), "statement done");
                    instance.set_status(Status::Success);
                    instance.set_results(rows.into_iter().map(Value::from).collect::<Vec<_>>());
                }
                Err(err) => {
                    log_failure(&instance, &err);
                    instance.set_status(Status::Failure);
                }
            }
            hand_back(&instance, done);
        });
        Ok(())
    }
}

fn log_failure(instance: &Instance, err: &SqlError) {
    let code = match err {
        SqlError::Statement { code, .. } => code.as_deref(),
        SqlError::Connect(_) => None,
    };
    error!(task = %instance.id(), error = %err, code = ?code, "statement failed");
}

fn batch(args: &[Value]) -> Vec<Vec<serde_json::Value>> {
    let to_json = |items: &[Value]| items.iter().map(Value::to_json).collect::<Vec<_>>();
    match args.first() {
        Some(Value::List(_)) => args
            .iter()
            .map(|entry| entry.as_list().map(to_json).unwrap_or_default())
            .collect(),
        _ => vec![to_json(args)],
    }
}

/// The connection cached on `db`, opened on first use.
async fn connection(
    db: &Instance,
    connector: &dyn SqlConnector,
) -> Result<Arc<dyn SqlConnection>, SqlError> {
    let cached = db
        .attachment(CONNECTION_KEY)
        .and_then(|v| v.as_handle().and_then(|h| h.downcast_ref::<ConnectionHandle>()).cloned());
    if let Some(ConnectionHandle(conn)) = cached {
        return Ok(conn);
    }
    let conn = connector.connect(&db.configure()).await?;
    db.attach(CONNECTION_KEY, Handle::new(ConnectionHandle(conn.clone())));
    debug!(db = %db.id(), "database connected");
    Ok(conn)
}

/// SQLite connections through sqlx.
#[cfg(feature = "sqlite")]
pub mod sqlite {
    use super::{SqlConnection, SqlConnector, SqlError, DEFAULT_DB_PATH};
    use async_trait::async_trait;
    use serde_json::Value as Json;
    use serialq_core::Config;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::{Column, Row, TypeInfo, ValueRef};
    use std::sync::Arc;

    /// Opens a pool on the `path` of `sq.Db`.
    pub struct SqliteConnector;

    #[async_trait]
    impl SqlConnector for SqliteConnector {
        async fn connect(&self, options: &Config) -> Result<Arc<dyn SqlConnection>, SqlError> {
            let path = options.str("path").unwrap_or(DEFAULT_DB_PATH);
            let max = options.int("maxConnections").filter(|n| *n > 0).unwrap_or(1);
            let pool = SqlitePoolOptions::new()
                .max_connections(u32::try_from(max).unwrap_or(1))
                .connect(path)
                .await
                .map_err(|e| SqlError::Connect(e.to_string()))?;
            Ok(Arc::new(SqlitePoolConnection { pool }))
        }
    }

    struct SqlitePoolConnection {
        pool: SqlitePool,
    }

    #[async_trait]
    impl SqlConnection for SqlitePoolConnection {
        async fn execute(&self, stmt: &str, args: &[Json]) -> Result<Vec<Json>, SqlError> {
            let mut query = sqlx::query(stmt);
            for arg in args {
                query = match arg {
                    Json::Null => query.bind(Option::<String>::None),
                    Json::Bool(b) => query.bind(*b),
                    Json::Number(n) => match n.as_i64() {
                        Some(i) => query.bind(i),
                        None => query.bind(n.as_f64()),
                    },
                    Json::String(s) => query.bind(s.clone()),
                    other => query.bind(other.to_string()),
                };
            }
            let rows = query.fetch_all(&self.pool).await.map_err(statement_error)?;
            Ok(rows.iter().map(row_to_json).collect())
        }
    }

    fn statement_error(err: sqlx::Error) -> SqlError {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        };
        SqlError::Statement {
            message: err.to_string(),
            code,
        }
    }

    fn row_to_json(row: &SqliteRow) -> Json {
        let mut map = serde_json::Map::new();
        for (i, column) in row.columns().iter().enumerate() {
            let value = match row.try_get_raw(i) {
                Ok(raw) if raw.is_null() => Json::Null,
                Ok(raw) => match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => row.try_get::<i64, _>(i).map(Json::from).unwrap_or(Json::Null),
                    "REAL" => row.try_get::<f64, _>(i).map(Json::from).unwrap_or(Json::Null),
                    "BLOB" => row.try_get::<Vec<u8>, _>(i).map(Json::from).unwrap_or(Json::Null),
                    _ => row.try_get::<String, _>(i).map(Json::String).unwrap_or(Json::Null),
                },
                Err(_) => Json::Null,
            };
            map.insert(column.name().to_string(), value);
        }
        Json::Object(map)
    }

}
