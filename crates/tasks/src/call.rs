//! Function invocation.

use serialq_core::{Completion, ConfigError, Instance, Task, TaskError, Value, INERT_FN_KEY};
use tracing::debug;

/// Calls the configured `fn` with `args` and records its return value.
///
/// The call runs synchronously; `status` is left untouched because a plain
/// function has no notion of failure.
pub struct CallTask;

impl Task for CallTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let f = match config.get(INERT_FN_KEY) {
            Some(Value::Func(f)) => f.clone(),
            Some(other) => {
                return Err(ConfigError::InvalidType {
                    key: INERT_FN_KEY.to_string(),
                    expected: "func",
                    found: other.kind(),
                }
                .into())
            }
            None => return Err(ConfigError::MissingKey(INERT_FN_KEY.to_string()).into()),
        };
        let args = config.list("args").unwrap_or_default();

        let results = f.call(instance, args);
        debug!(task = %instance.id(), args = args.len(), "function called");
        instance.set_results(results);
        done.delegate(instance)
    }
}
