//! Task adapters: the concrete units of work a plan is built from.
//!
//! Every adapter resolves its configuration, performs one external effect,
//! records a status and results on the instance and then hands the
//! completion token back up the class chain, so the queue always moves on.
//! Failures of the effect itself become a failure status; only missing or
//! malformed configuration is raised as a [`TaskError`].

#![warn(missing_docs)]

pub mod call;
pub mod check;
pub mod command;
pub mod http;
pub mod sql;
pub mod storage;
pub mod worker;

pub use call::CallTask;
pub use check::CheckTask;
pub use command::CommandTask;
pub use http::HttpTask;
pub use sql::{SqlConnection, SqlConnector, SqlError, SqlTask};
pub use storage::{StorageTask, StoreHandle};
pub use worker::{FnWorker, Worker, WorkerPool, WorkerTask};

#[cfg(feature = "sqlite")]
pub use sql::sqlite::SqliteConnector;

use serialq_core::{ClassError, ClassRegistry, ClassSpec, Completion, Config, Instance, TaskError, Value};
use serialq_storage::{MemoryStore, Store};
use std::sync::Arc;
use tracing::{debug, error};

/// Class names defined by [`install`].
pub mod classes {
    /// Invoke a function
    pub const CALL: &str = "sq.Call";
    /// Evaluate expectations
    pub const CHECK: &str = "sq.Check";
    /// Key/value store access
    pub const STORAGE: &str = "sq.Storage";
    /// Key/value store access against a private in-memory store
    pub const STORAGE_MEMORY: &str = "sq.Storage.Memory";
    /// HTTP request
    pub const HTTP: &str = "sq.Http";
    /// Message round trip with a named worker
    pub const WORKER: &str = "sq.Worker";
    /// Shared database handle
    pub const DB: &str = "sq.Db";
    /// SQL statement
    pub const SQL: &str = "sq.Sql";
    /// External program
    pub const COMMAND: &str = "sq.Command";
}

/// External resources the adapters talk to.
pub struct Services {
    /// Store used by `sq.Storage`
    pub store: Arc<dyn Store>,
    /// Workers reachable from `sq.Worker`
    pub workers: WorkerPool,
    /// Opens the `sq.Db` connection for `sq.Sql`
    pub sql: Option<Arc<dyn SqlConnector>>,
    /// Options for the `sq.Db` singleton
    pub db: Config,
    /// Client for `sq.Http`
    pub http: reqwest::Client,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            workers: WorkerPool::new(),
            sql: default_connector(),
            db: Config::new(),
            http: reqwest::Client::new(),
        }
    }
}

impl Services {
    /// Replace the store used by `sq.Storage`.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Replace the worker pool.
    pub fn with_workers(mut self, workers: WorkerPool) -> Self {
        self.workers = workers;
        self
    }

    /// Replace the SQL connector.
    pub fn with_sql(mut self, connector: Arc<dyn SqlConnector>) -> Self {
        self.sql = Some(connector);
        self
    }

    /// Set options for the `sq.Db` singleton.
    pub fn with_db(mut self, options: Config) -> Self {
        self.db = options;
        self
    }
}

#[cfg(feature = "sqlite")]
fn default_connector() -> Option<Arc<dyn SqlConnector>> {
    Some(Arc::new(SqliteConnector))
}

#[cfg(not(feature = "sqlite"))]
fn default_connector() -> Option<Arc<dyn SqlConnector>> {
    None
}

/// Define the adapter classes on `registry`.
///
/// The `sq.Db` singleton is constructed here so that `sq.Sql` can default
/// its `db` option to it.
pub fn install(registry: &ClassRegistry, services: Services) -> Result<(), ClassError> {
    registry.define(
        ClassSpec::new(classes::CALL)
            .defaults(Config::new().with("args", Value::List(Vec::new())))
            .execute(CallTask),
    )?;

    registry.define_multiton(ClassSpec::new(classes::CHECK).execute(CheckTask))?;

    registry.define(
        ClassSpec::new(classes::STORAGE)
            .defaults(storage::defaults(services.store))
            .execute(StorageTask),
    )?;
    registry.define(
        ClassSpec::new(classes::STORAGE_MEMORY)
            .extends(classes::STORAGE)
            .defaults(Config::new().with("store", StoreHandle::new(Arc::new(MemoryStore::new())))),
    )?;

    registry.define(
        ClassSpec::new(classes::HTTP)
            .defaults(http::defaults())
            .execute(HttpTask::new(services.http)),
    )?;

    registry.define(
        ClassSpec::new(classes::WORKER)
            .defaults(Config::new().with("wait", 1))
            .execute(WorkerTask::new(services.workers)),
    )?;

    registry.define_singleton(ClassSpec::new(classes::DB).defaults(sql::db_defaults()))?;
    let db = registry.construct(classes::DB, services.db)?;
    registry.define(
        ClassSpec::new(classes::SQL)
            .defaults(
                Config::new()
                    .with("db", db)
                    .with("stmt", "")
                    .with("args", Value::List(Vec::new())),
            )
            .execute(SqlTask::new(services.sql)),
    )?;

    registry.define(
        ClassSpec::new(classes::COMMAND)
            .defaults(Config::new().with("args", Value::List(Vec::new())))
            .execute(CommandTask),
    )?;

    debug!("adapter classes installed");
    Ok(())
}

/// Runtime handle for adapters that finish on a tokio task.
pub(crate) fn runtime(instance: &Instance) -> Result<tokio::runtime::Handle, TaskError> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| TaskError::NoRuntime(instance.class_name().to_string()))
}

/// Pass the completion token to the inherited `execute` from inside a
/// spawned future, where an error has nowhere to propagate.
pub(crate) fn hand_back(instance: &Instance, done: Completion) {
    if let Err(err) = done.delegate(instance) {
        error!(task = %instance.id(), class = instance.class_name(), error = %err, "inherited execute failed");
    }
}
