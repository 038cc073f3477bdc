//! Key/value store access.
//!
//! Values are written as JSON text so that numbers, booleans and structures
//! come back with their type on `getItem`. Text that is not valid JSON is
//! returned as a plain string, which keeps entries written by other tools
//! readable.

use crate::{hand_back, runtime};
use serialq_core::{Completion, Config, ConfigError, Handle, Instance, Status, Task, TaskError, Value};
use serialq_storage::Store;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A [`Store`] carried through configuration as a [`Handle`].
#[derive(Clone)]
pub struct StoreHandle(pub Arc<dyn Store>);

impl StoreHandle {
    /// Wrap `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self(store)
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreHandle")
    }
}

impl From<StoreHandle> for Value {
    fn from(store: StoreHandle) -> Self {
        Value::Handle(Handle::new(store))
    }
}

/// `sq.Storage` defaults over `store`.
pub(crate) fn defaults(store: Arc<dyn Store>) -> Config {
    Config::new()
        .with("action", "")
        .with("expects", "")
        .with("store", StoreHandle::new(store))
}

#[derive(Debug)]
enum Action {
    SetItem { key: String, value: Value },
    GetItem { key: String },
    RemoveItem { key: String },
    Clear,
    Key { index: usize },
    Length,
}

impl Action {
    fn parse(config: &Config) -> Result<Self, TaskError> {
        let key = || config.require_str("key").map(str::to_string);
        let action = match config.require_str("action")? {
            "setItem" => Action::SetItem {
                key: key()?,
                value: config.get("value").cloned().unwrap_or_default(),
            },
            "getItem" => Action::GetItem { key: key()? },
            "removeItem" => Action::RemoveItem { key: key()? },
            "clear" => Action::Clear,
            "key" => {
                let index = config
                    .int("index")
                    .ok_or_else(|| ConfigError::MissingKey("index".to_string()))?;
                Action::Key {
                    index: usize::try_from(index).unwrap_or(usize::MAX),
                }
            }
            "length" => Action::Length,
            other => return Err(TaskError::Other(format!("unknown storage action `{other}`"))),
        };
        Ok(action)
    }
}

/// Runs one store action and records its outcome.
///
/// - `setItem`: results are the value written
/// - `getItem`: the stored value, or `expects` when the key is absent
/// - `removeItem`: whether the key existed
/// - `clear`: null
/// - `key`: the key at `index`, or `expects`
/// - `length`: number of keys
pub struct StorageTask;

impl Task for StorageTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let action = Action::parse(&config)?;
        let store = config
            .get("store")
            .and_then(Value::as_handle)
            .and_then(|h| h.downcast_ref::<StoreHandle>())
            .map(|h| h.0.clone())
            .ok_or_else(|| ConfigError::MissingKey("store".to_string()))?;
        let expects = config.get("expects").cloned().unwrap_or_default();
        let rt = runtime(instance)?;

        let instance = instance.clone();
        rt.spawn(async move {
            match run(store.as_ref(), action, expects).await {
                Ok(results) => {
                    debug!(task = %instance.id(), "storage action done");
                    instance.set_status(Status::Success);
                    instance.set_results(results);
                }
                Err(err) => {
                    warn!(task = %instance.id(), error = %err, "storage action failed");
                    instance.set_status(Status::Failure);
                }
            }
            hand_back(&instance, done);
        });
        Ok(())
    }
}

async fn run(store: &dyn Store, action: Action, expects: Value) -> serialq_storage::Result<Value> {
    let value = match action {
        Action::SetItem { key, value } => {
            let text = serde_json::to_string(&value.to_json())?;
            store.set_item(&key, &text).await?;
            value
        }
        Action::GetItem { key } => match store.get_item(&key).await? {
            Some(text) => decode(text),
            None => expects,
        },
        Action::RemoveItem { key } => Value::Bool(store.remove_item(&key).await?),
        Action::Clear => {
            store.clear().await?;
            Value::Null
        }
        Action::Key { index } => store.key(index).await?.map(Value::from).unwrap_or(expects),
        Action::Length => Value::from(store.len().await? as i64),
    };
    Ok(value)
}

fn decode(text: String) -> Value {
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Value::from(json),
        Err(_) => Value::String(text),
    }
}
