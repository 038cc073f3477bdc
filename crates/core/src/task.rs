//! The contract every schedulable unit of work satisfies.

use crate::class::{ClassError, ExecuteSlot};
use crate::id::InstanceId;
use crate::instance::Instance;
use crate::value::ConfigError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors a task's `execute` can raise.
///
/// These are structural: a misconfigured task or a missing host facility.
/// Failures of the task's external effect are recorded as a
/// [`Status`](crate::Status) instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Required configuration is missing or malformed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Class lookup or construction failed
    #[error(transparent)]
    Class(#[from] ClassError),

    /// Named method not present in the class's method table
    #[error("class `{class}` has no method `{method}`")]
    UnknownMethod {
        /// Class searched
        class: String,
        /// Requested method
        method: String,
    },

    /// An async adapter ran outside a tokio runtime
    #[error("`{0}` needs a running tokio runtime")]
    NoRuntime(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// A unit of work the scheduler can run.
///
/// `execute` may finish synchronously or hand off to an asynchronous
/// operation. Either way it must, on every completion path, eventually
/// consume `done` through [`Completion::advance`] or
/// [`Completion::delegate`]. A task that never does stalls the queue for good.
pub trait Task: Send + Sync {
    /// Perform the task's effect.
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError>;
}

impl<F> Task for F
where
    F: Fn(&Instance, Completion) -> Result<(), TaskError> + Send + Sync,
{
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        self(instance, done)
    }
}

/// Execute behaviour of the root class: advance immediately.
pub struct BaseTask;

impl Task for BaseTask {
    fn execute(&self, _instance: &Instance, done: Completion) -> Result<(), TaskError> {
        done.advance();
        Ok(())
    }
}

/// Receiver of queue registrations and advance signals.
pub trait Dispatcher: Send + Sync {
    /// Append a task to the queue.
    fn enqueue(&self, task: Instance);

    /// Ask for the next task to be dequeued and run.
    fn advance(&self);
}

/// Dispatcher that drops registrations and ignores advance signals.
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn enqueue(&self, task: Instance) {
        debug!(task = %task.id(), class = task.class_name(), "discarding registration");
    }

    fn advance(&self) {}
}

/// One-shot token a running task consumes to let the queue move on.
///
/// The token cannot be cloned, so a task can signal at most once. Dropping it
/// unsignalled logs a warning but does not advance.
pub struct Completion {
    dispatcher: Option<Arc<dyn Dispatcher>>,
    next: Option<Arc<ExecuteSlot>>,
    task: InstanceId,
    signalled: bool,
}

impl Completion {
    pub(crate) fn new(
        dispatcher: Option<Arc<dyn Dispatcher>>,
        next: Option<Arc<ExecuteSlot>>,
        task: InstanceId,
    ) -> Self {
        Self {
            dispatcher,
            next,
            task,
            signalled: false,
        }
    }

    /// The task this token belongs to.
    pub fn task_id(&self) -> InstanceId {
        self.task
    }

    /// Signal the scheduler to run the next task.
    pub fn advance(mut self) {
        self.signalled = true;
        if let Some(dispatcher) = self.dispatcher.take() {
            debug!(task = %self.task, "advance");
            dispatcher.advance();
        }
    }

    /// Hand the token to the ancestor's `execute`.
    ///
    /// Lets an override add behaviour and leave the advance to the inherited
    /// implementation. With no overriding ancestor this advances directly.
    pub fn delegate(mut self, instance: &Instance) -> Result<(), TaskError> {
        self.signalled = true;
        let dispatcher = self.dispatcher.take();
        match self.next.take() {
            Some(slot) => {
                let done = Completion::new(dispatcher, slot.parent().cloned(), self.task);
                slot.task().execute(instance, done)
            }
            None => {
                if let Some(dispatcher) = dispatcher {
                    debug!(task = %self.task, "advance");
                    dispatcher.advance();
                }
                Ok(())
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.signalled && self.dispatcher.is_some() {
            warn!(task = %self.task, "completion dropped without advancing; queue is stalled");
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("task", &self.task)
            .field("attached", &self.dispatcher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassSpec;
    use crate::registry::ClassRegistry;
    use crate::value::Config;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        enqueued: AtomicUsize,
        advanced: AtomicUsize,
    }

    impl Dispatcher for Recorder {
        fn enqueue(&self, _task: Instance) {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
        }

        fn advance(&self) {
            self.advanced.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_base_task_advances_once() {
        let recorder = Arc::new(Recorder::default());
        let registry = ClassRegistry::new(recorder.clone());
        let inst = registry.construct("Base", Config::new()).unwrap();

        inst.run(recorder.clone()).unwrap();
        assert_eq!(recorder.advanced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delegate_walks_up_the_chain() {
        let recorder = Arc::new(Recorder::default());
        let registry = ClassRegistry::new(recorder.clone());
        let trail = Arc::new(Mutex::new(Vec::new()));

        let t = trail.clone();
        registry
            .define(ClassSpec::new("app.Parent").execute(move |inst: &Instance, done: Completion| {
                t.lock().unwrap().push("parent");
                done.delegate(inst)
            }))
            .unwrap();
        let t = trail.clone();
        registry
            .define(
                ClassSpec::new("app.Child")
                    .extends("app.Parent")
                    .execute(move |inst: &Instance, done: Completion| {
                        t.lock().unwrap().push("child");
                        done.delegate(inst)
                    }),
            )
            .unwrap();
        // inherits Child's execute without overriding it
        registry
            .define(ClassSpec::new("app.Child.Leaf").extends("app.Child"))
            .unwrap();

        let leaf = registry.construct("app.Child.Leaf", Config::new()).unwrap();
        leaf.run(recorder.clone()).unwrap();

        assert_eq!(*trail.lock().unwrap(), vec!["child", "parent"]);
        assert_eq!(recorder.advanced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completion_does_not_advance() {
        let recorder = Arc::new(Recorder::default());
        let registry = ClassRegistry::new(recorder.clone());
        registry
            .define(ClassSpec::new("app.Stuck").execute(|_: &Instance, done: Completion| {
                drop(done);
                Ok(())
            }))
            .unwrap();

        let inst = registry.construct("app.Stuck", Config::new()).unwrap();
        inst.run(recorder.clone()).unwrap();
        assert_eq!(recorder.advanced.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detached_run_needs_no_dispatcher() {
        let registry = ClassRegistry::new(Arc::new(NullDispatcher));
        let inst = registry.construct("Base", Config::new()).unwrap();
        assert!(inst.run_detached().is_ok());
    }
}
