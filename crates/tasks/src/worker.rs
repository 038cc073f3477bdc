//! Message round trips with background workers.

use crate::{hand_back, runtime};
use async_trait::async_trait;
use serialq_core::{Completion, Instance, Status, Task, TaskError, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 16;

/// A background worker reachable by name.
///
/// Each task run gets a fresh worker session: the message arrives as JSON
/// text on `inbox`, replies go out as JSON text on `outbox`. `inbox` closes
/// once the message is delivered; dropping `outbox` ends the session.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Serve one session.
    async fn run(&self, inbox: mpsc::Receiver<String>, outbox: mpsc::Sender<String>);
}

/// Worker answering each message with the replies a function returns.
pub struct FnWorker<F>(F);

impl<F> FnWorker<F>
where
    F: Fn(serde_json::Value) -> Vec<serde_json::Value> + Send + Sync,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Worker for FnWorker<F>
where
    F: Fn(serde_json::Value) -> Vec<serde_json::Value> + Send + Sync,
{
    async fn run(&self, mut inbox: mpsc::Receiver<String>, outbox: mpsc::Sender<String>) {
        while let Some(message) = inbox.recv().await {
            let message = serde_json::from_str(&message).unwrap_or(serde_json::Value::String(message));
            for reply in (self.0)(message) {
                if outbox.send(reply.to_string()).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Named workers available to `sq.Worker`.
#[derive(Clone, Default)]
pub struct WorkerPool {
    workers: Arc<RwLock<HashMap<String, Arc<dyn Worker>>>>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, worker: impl Worker + 'static) {
        let name = name.into();
        debug!(worker = %name, "registered worker");
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(worker));
    }

    /// Look up a worker.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.names()).finish()
    }
}

/// Posts `message` to the worker named by `url` and waits for `wait` replies.
///
/// Results are the replies received, parsed as JSON. The worker ending the
/// session early, or no worker by that name, sets `failure`.
pub struct WorkerTask {
    pool: WorkerPool,
}

impl WorkerTask {
    /// Create the adapter over `pool`.
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }
}

impl Task for WorkerTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let name = config.require_str("url")?.to_string();
        let message = config.get("message").cloned().unwrap_or_default().to_json().to_string();
        let wait = config.int("wait").filter(|w| *w > 0).unwrap_or(1) as usize;
        let worker = self.pool.get(&name);
        let rt = runtime(instance)?;

        let instance = instance.clone();
        rt.spawn(async move {
            let Some(worker) = worker else {
                warn!(task = %instance.id(), worker = %name, "no such worker");
                instance.set_status(Status::Failure);
                hand_back(&instance, done);
                return;
            };

            let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
            let (out_tx, mut out_rx) = mpsc::channel(CHANNEL_CAPACITY);
            tokio::spawn(async move { worker.run(in_rx, out_tx).await });

            // one message per session; closing the inbox lets the worker finish
            let sent = in_tx.send(message).await.is_ok();
            drop(in_tx);

            let mut replies = Vec::with_capacity(wait);
            while sent && replies.len() < wait {
                match out_rx.recv().await {
                    Some(reply) => replies.push(parse_reply(reply)),
                    None => break,
                }
            }

            if replies.len() == wait {
                debug!(task = %instance.id(), worker = %name, replies = wait, "worker replied");
                instance.set_status(Status::Success);
            } else {
                warn!(
                    task = %instance.id(),
                    worker = %name,
                    expected = wait,
                    received = replies.len(),
                    "worker closed before replying"
                );
                instance.set_status(Status::Failure);
            }
            instance.set_results(replies);
            hand_back(&instance, done);
        });
        Ok(())
    }
}

fn parse_reply(reply: String) -> Value {
    match serde_json::from_str::<serde_json::Value>(&reply) {
        Ok(json) => Value::from(json),
        Err(_) => Value::String(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes;
    use crate::testing::{drain, harness};
    use crate::Services;
    use serde_json::json;
    use serialq_core::Config;

    fn pool() -> WorkerPool {
        let pool = WorkerPool::new();
        pool.register(
            "echo",
            FnWorker::new(|msg| vec![json!({"echo": msg}), json!("done")]),
        );
        pool.register("silent", FnWorker::new(|_| Vec::new()));
        pool
    }

    #[tokio::test]
    async fn test_waits_for_replies() {
        let (scheduler, registry) = harness(Services::default().with_workers(pool()));
        let one = registry
            .construct(classes::WORKER, Config::new().with("url", "echo").with("message", "hi"))
            .unwrap();
        let two = registry
            .construct(
                classes::WORKER,
                Config::new().with("url", "echo").with("message", 7).with("wait", 2),
            )
            .unwrap();

        drain(&scheduler).await;
        assert_eq!(one.status(), Some(Status::Success));
        assert_eq!(one.results().to_json(), json!([{"echo": "hi"}]));
        assert_eq!(two.results().to_json(), json!([{"echo": 7}, "done"]));
    }

    #[tokio::test]
    async fn test_early_close_is_failure() {
        let (scheduler, registry) = harness(Services::default().with_workers(pool()));
        let short = registry
            .construct(classes::WORKER, Config::new().with("url", "echo").with("wait", 3))
            .unwrap();
        let silent = registry
            .construct(classes::WORKER, Config::new().with("url", "silent"))
            .unwrap();

        drain(&scheduler).await;
        assert_eq!(short.status(), Some(Status::Failure));
        assert_eq!(short.results().as_list().map(<[Value]>::len), Some(2));
        assert_eq!(silent.status(), Some(Status::Failure));
    }

    #[tokio::test]
    async fn test_unknown_worker_is_failure() {
        let (scheduler, registry) = harness(Services::default());
        let task = registry
            .construct(classes::WORKER, Config::new().with("url", "nobody"))
            .unwrap();

        drain(&scheduler).await;
        assert_eq!(task.status(), Some(Status::Failure));
    }
}
