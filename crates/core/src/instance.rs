//! Constructed instances and their task status.

use crate::class::ClassDescriptor;
use crate::id::InstanceId;
use crate::merge::resolve;
use crate::task::{Completion, Dispatcher, TaskError};
use crate::value::{Config, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome label a task records when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// The external effect succeeded
    Success,
    /// The external effect failed
    Failure,
    /// A check matched its expectation
    Passed,
    /// A check did not match its expectation
    Failed,
    /// Adapter-specific label
    Other(String),
}

impl Status {
    /// Whether the label reports a problem.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failure | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Failure => write!(f, "failure"),
            Status::Passed => write!(f, "passed"),
            Status::Failed => write!(f, "failed"),
            Status::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s {
            "success" => Status::Success,
            "failure" => Status::Failure,
            "passed" => Status::Passed,
            "failed" => Status::Failed,
            other => Status::Other(other.to_string()),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Status::from(s.as_str()))
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InstanceInner {
    id: InstanceId,
    class: Arc<ClassDescriptor>,
    config: Config,
    status: Mutex<Option<Status>>,
    results: Mutex<Value>,
    attachments: Mutex<BTreeMap<String, Value>>,
}

/// A constructed object: class, configuration snapshot and task outcome.
///
/// Cloning is cheap and yields another handle to the same instance.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

impl Instance {
    pub(crate) fn new(class: Arc<ClassDescriptor>, config: Config) -> Self {
        Self(Arc::new(InstanceInner {
            id: InstanceId::new(),
            class,
            config,
            status: Mutex::new(None),
            results: Mutex::new(Value::Null),
            attachments: Mutex::new(BTreeMap::new()),
        }))
    }

    /// Unique id.
    pub fn id(&self) -> InstanceId {
        self.0.id
    }

    /// Owning class.
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.0.class
    }

    /// Owning class name.
    pub fn class_name(&self) -> &str {
        self.0.class.name()
    }

    /// Parent of the owning class.
    pub fn parent_class(&self) -> Option<&Arc<ClassDescriptor>> {
        self.0.class.parent()
    }

    /// Configuration snapshot taken at construction.
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Resolve the snapshot into execution parameters.
    pub fn configure(&self) -> Config {
        resolve(self, &self.0.config)
    }

    /// Last recorded status.
    pub fn status(&self) -> Option<Status> {
        lock(&self.0.status).clone()
    }

    /// Record a status.
    pub fn set_status(&self, status: Status) {
        *lock(&self.0.status) = Some(status);
    }

    /// Last recorded results.
    pub fn results(&self) -> Value {
        lock(&self.0.results).clone()
    }

    /// Record results.
    pub fn set_results(&self, results: impl Into<Value>) {
        *lock(&self.0.results) = results.into();
    }

    /// Keep a runtime value (connection, cache) on the instance.
    pub fn attach(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.0.attachments).insert(key.into(), value.into());
    }

    /// Read a value stored with [`attach`](Self::attach).
    pub fn attachment(&self, key: &str) -> Option<Value> {
        lock(&self.0.attachments).get(key).cloned()
    }

    /// Invoke a named method from the class's method table.
    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value, TaskError> {
        let f = self
            .0
            .class
            .methods()
            .method(method)
            .ok_or_else(|| TaskError::UnknownMethod {
                class: self.class_name().to_string(),
                method: method.to_string(),
            })?;
        f(self, args)
    }

    /// Run `execute`, signalling `dispatcher` on completion.
    pub fn run(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), TaskError> {
        self.run_with(Some(dispatcher))
    }

    /// Run `execute` outside any scheduler.
    pub fn run_detached(&self) -> Result<(), TaskError> {
        self.run_with(None)
    }

    fn run_with(&self, dispatcher: Option<Arc<dyn Dispatcher>>) -> Result<(), TaskError> {
        let slot = self.0.class.methods().execute().clone();
        let done = Completion::new(dispatcher, slot.parent().cloned(), self.id());
        slot.task().execute(self, done)
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.0.id)
            .field("class", &self.class_name())
            .field("status", &self.status())
            .finish()
    }
}
