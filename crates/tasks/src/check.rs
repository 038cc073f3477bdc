//! Expectation checks.

use serialq_core::{Completion, Config, ConfigError, Instance, Status, Task, TaskError, Value, INERT_FN_KEY};
use tracing::warn;

/// Evaluates one test, or a list of tests, against their expectations.
///
/// A test is a mapping with a `fn` to call and the value it `expects`. With a
/// list the results hold every value produced and evaluation stops at the
/// first mismatch. Status is `passed` only when every evaluated test matched.
pub struct CheckTask;

impl Task for CheckTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let passed = match config.get("test") {
            Some(Value::List(tests)) => {
                let mut results = Vec::with_capacity(tests.len());
                let mut passed = true;
                for test in tests {
                    let test = as_test(test)?;
                    let (value, ok) = evaluate(instance, test)?;
                    results.push(value);
                    if !ok {
                        passed = false;
                        break;
                    }
                }
                instance.set_results(results);
                passed
            }
            Some(test) => {
                let (value, ok) = evaluate(instance, as_test(test)?)?;
                instance.set_results(value);
                ok
            }
            None => return Err(ConfigError::MissingKey("test".to_string()).into()),
        };

        if passed {
            instance.set_status(Status::Passed);
        } else {
            instance.set_status(Status::Failed);
            warn!(task = %instance.id(), results = %instance.results().to_json(), "check failed");
        }
        done.delegate(instance)
    }
}

fn as_test(value: &Value) -> Result<&Config, TaskError> {
    value.as_map().ok_or_else(|| {
        ConfigError::InvalidType {
            key: "test".to_string(),
            expected: "map",
            found: value.kind(),
        }
        .into()
    })
}

fn evaluate(instance: &Instance, test: &Config) -> Result<(Value, bool), TaskError> {
    let f = test
        .get(INERT_FN_KEY)
        .and_then(Value::as_func)
        .ok_or_else(|| ConfigError::MissingKey(format!("test.{INERT_FN_KEY}")))?;
    let value = f.call(instance, &[]);
    let expects = test.get("expects").cloned().unwrap_or_default();
    let ok = value == expects;
    Ok((value, ok))
}

#[cfg(test)]
mod tests {
    use crate::classes;
    use crate::testing::{drain, harness};
    use crate::Services;
    use serialq_core::{Config, Func, Status, TaskError, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test(result: i64, expects: i64) -> Value {
        Value::from(
            Config::new()
                .with("fn", Func::new(move |_, _| Value::from(result)))
                .with("expects", expects),
        )
    }

    #[tokio::test]
    async fn test_single_check() {
        let (scheduler, registry) = harness(Services::default());
        let pass = registry.construct(classes::CHECK, Config::new().with("test", test(1, 1))).unwrap();
        let fail = registry.construct(classes::CHECK, Config::new().with("test", test(1, 2))).unwrap();

        drain(&scheduler).await;
        assert_eq!(pass.status(), Some(Status::Passed));
        assert_eq!(pass.results(), Value::from(1));
        assert_eq!(fail.status(), Some(Status::Failed));
        assert_eq!(registry.instances(classes::CHECK).len(), 2);
    }

    #[tokio::test]
    async fn test_list_stops_at_first_failure() {
        let (scheduler, registry) = harness(Services::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = calls.clone();
            Value::from(
                Config::new()
                    .with(
                        "fn",
                        Func::new(move |_, _| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Value::from(9)
                        }),
                    )
                    .with("expects", 9),
            )
        };
        let task = registry
            .construct(
                classes::CHECK,
                Config::new().with("test", vec![test(1, 1), test(2, 3), counted]),
            )
            .unwrap();

        drain(&scheduler).await;
        assert_eq!(task.status(), Some(Status::Failed));
        assert_eq!(task.results(), Value::List(vec![Value::from(1), Value::from(2)]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_passing_list() {
        let (scheduler, registry) = harness(Services::default());
        let task = registry
            .construct(classes::CHECK, Config::new().with("test", vec![test(1, 1), test(2, 2)]))
            .unwrap();

        drain(&scheduler).await;
        assert_eq!(task.status(), Some(Status::Passed));
    }

    #[test]
    fn test_missing_fn_is_structural() {
        let (_scheduler, registry) = harness(Services::default());
        let task = registry
            .construct(classes::CHECK, Config::new().with("test", Config::new().with("expects", 1)))
            .unwrap();
        assert!(matches!(task.run_detached(), Err(TaskError::Config(_))));
    }
}
