//! External programs.

use crate::{hand_back, runtime};
use serialq_core::{Completion, Instance, Status, Task, TaskError, Value};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs `program` with `args` and the extra `env` variables.
///
/// Exit status 0 sets `success` with standard output as results; any other
/// exit, or a program that cannot be started, sets `failure` with standard
/// error (or the spawn error) as results.
pub struct CommandTask;

impl Task for CommandTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let program = config.require_str("program")?.to_string();

        let mut cmd = Command::new(&program);
        cmd.args(config.list("args").unwrap_or_default().iter().map(arg_text));
        if let Some(env) = config.map("env") {
            for (k, v) in env.iter() {
                cmd.env(k, arg_text(v));
            }
        }
        cmd.kill_on_drop(true);
        let rt = runtime(instance)?;

        let instance = instance.clone();
        rt.spawn(async move {
            let start = std::time::Instant::now();
            match cmd.output().await {
                Ok(output) if output.status.success() => {
                    debug!(
                        task = %instance.id(),
                        program = %program,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "command finished"
                    );
                    instance.set_status(Status::Success);
                    instance.set_results(String::from_utf8_lossy(&output.stdout).trim_end().to_string());
                }
                Ok(output) => {
                    warn!(
                        task = %instance.id(),
                        program = %program,
                        code = output.status.code().unwrap_or(-1),
                        "command failed"
                    );
                    instance.set_status(Status::Failure);
                    instance.set_results(String::from_utf8_lossy(&output.stderr).trim_end().to_string());
                }
                Err(err) => {
                    warn!(task = %instance.id(), program = %program, error = %err, "command could not start");
                    instance.set_status(Status::Failure);
                    instance.set_results(err.to_string());
                }
            }
            hand_back(&instance, done);
        });
        Ok(())
    }
}

fn arg_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}
