//! Layered configuration: override-merge and execution-time resolution.

use crate::instance::Instance;
use crate::value::{Config, Value};

/// Reserved key whose callable value is stored, not invoked, by [`resolve`].
pub const INERT_FN_KEY: &str = "fn";

/// Merge `sources` into `target` left to right.
///
/// Each source overwrites same-named keys already present. The merge is
/// shallow: nested mappings are replaced, not combined.
pub fn merge<'a>(mut target: Config, sources: impl IntoIterator<Item = &'a Config>) -> Config {
    for source in sources {
        for (key, value) in source.iter() {
            target.insert(key.clone(), value.clone());
        }
    }
    target
}

/// Expand a configuration snapshot into the values a task executes with.
///
/// - instance and handle references are copied by reference
/// - nested lists and mappings are resolved recursively, keeping their shape
/// - callables are invoked with `instance` and replaced by their result,
///   except under [`INERT_FN_KEY`]
/// - everything else is copied
pub fn resolve(instance: &Instance, config: &Config) -> Config {
    config
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(instance, key, value)))
        .collect()
}

fn resolve_value(instance: &Instance, key: &str, value: &Value) -> Value {
    match value {
        Value::Instance(_) | Value::Handle(_) => value.clone(),
        Value::Map(map) => Value::Map(resolve(instance, map)),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| resolve_value(instance, "", item))
                .collect(),
        ),
        Value::Func(f) if key == INERT_FN_KEY => Value::Func(f.clone()),
        Value::Func(f) => f.call(instance, &[]),
        other => other.clone(),
    }
}
