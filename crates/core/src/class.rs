//! Class descriptors: name, parent, defaults, policy and method table.

use crate::instance::Instance;
use crate::task::{Task, TaskError};
use crate::value::{Config, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of the root class every other class descends from.
pub const BASE_CLASS: &str = "Base";

/// Errors defining or constructing classes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassError {
    /// Name is not a dotted path of identifiers
    #[error("invalid class name `{0}`")]
    InvalidName(String),

    /// No class registered under the name
    #[error("unknown class `{0}`")]
    UnknownClass(String),

    /// Enclosing namespace of a nested name is not a registered class
    #[error("namespace `{namespace}` for class `{name}` is not defined")]
    MissingNamespace {
        /// Requested class name
        name: String,
        /// Enclosing path that was not found
        namespace: String,
    },

    /// A class with this name already exists
    #[error("class `{0}` is already defined")]
    AlreadyDefined(String),
}

/// How construction maps to instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Every construction yields a new, scheduled instance
    Plain,
    /// One shared instance per class, never scheduled
    Single,
    /// Every construction yields a new, scheduled instance kept in a registry
    Multi,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Plain => write!(f, "plain"),
            Policy::Single => write!(f, "single"),
            Policy::Multi => write!(f, "multi"),
        }
    }
}

/// Named method callable through [`Instance::call`].
pub type Method = Arc<dyn Fn(&Instance, &[Value]) -> Result<Value, TaskError> + Send + Sync>;

/// An `execute` implementation plus the one it overrides.
pub struct ExecuteSlot {
    task: Arc<dyn Task>,
    parent: Option<Arc<ExecuteSlot>>,
}

impl ExecuteSlot {
    pub(crate) fn root(task: Arc<dyn Task>) -> Arc<Self> {
        Arc::new(Self { task, parent: None })
    }

    pub(crate) fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// The overridden ancestor implementation, if any.
    pub fn parent(&self) -> Option<&Arc<ExecuteSlot>> {
        self.parent.as_ref()
    }

    /// Number of implementations in the override chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }
}

/// Methods resolved once at definition time.
#[derive(Clone)]
pub struct MethodTable {
    execute: Arc<ExecuteSlot>,
    methods: BTreeMap<String, Method>,
}

impl MethodTable {
    pub(crate) fn root(execute: Arc<dyn Task>) -> Self {
        Self {
            execute: ExecuteSlot::root(execute),
            methods: BTreeMap::new(),
        }
    }

    /// Copy `parent`, overriding `execute` and named methods where given.
    pub(crate) fn derive(
        parent: &MethodTable,
        execute: Option<Arc<dyn Task>>,
        methods: BTreeMap<String, Method>,
    ) -> Self {
        let execute = match execute {
            Some(task) => Arc::new(ExecuteSlot {
                task,
                parent: Some(parent.execute.clone()),
            }),
            None => parent.execute.clone(),
        };
        let mut table = parent.methods.clone();
        table.extend(methods);
        Self {
            execute,
            methods: table,
        }
    }

    /// The active `execute` implementation.
    pub fn execute(&self) -> &Arc<ExecuteSlot> {
        &self.execute
    }

    /// Look up a named method.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Names of all methods, inherited ones included.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("execute_depth", &self.execute.depth())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything needed to define a class.
pub struct ClassSpec {
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    pub(crate) defaults: Config,
    pub(crate) execute: Option<Arc<dyn Task>>,
    pub(crate) methods: BTreeMap<String, Method>,
    pub(crate) schedulable: Option<bool>,
}

impl ClassSpec {
    /// Start a spec for `name`, inheriting from [`BASE_CLASS`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            defaults: Config::new(),
            execute: None,
            methods: BTreeMap::new(),
            schedulable: None,
        }
    }

    /// Set the parent class.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set the class defaults, layered over the parent's.
    pub fn defaults(mut self, defaults: impl Into<Config>) -> Self {
        self.defaults = defaults.into();
        self
    }

    /// Override `execute`.
    pub fn execute(mut self, task: impl Task + 'static) -> Self {
        self.execute = Some(Arc::new(task));
        self
    }

    /// Override `execute` with a shared implementation.
    pub fn execute_shared(mut self, task: Arc<dyn Task>) -> Self {
        self.execute = Some(task);
        self
    }

    /// Add or override a named method.
    pub fn method(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Instance, &[Value]) -> Result<Value, TaskError> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    /// Whether plain and multi constructions register with the scheduler.
    /// Inherited from the parent when unset.
    pub fn schedulable(mut self, schedulable: bool) -> Self {
        self.schedulable = Some(schedulable);
        self
    }
}

/// An immutable, registered class.
pub struct ClassDescriptor {
    name: String,
    parent: Option<Arc<ClassDescriptor>>,
    defaults: Config,
    policy: Policy,
    schedulable: bool,
    methods: MethodTable,
}

impl ClassDescriptor {
    pub(crate) fn root(execute: Arc<dyn Task>) -> Self {
        Self {
            name: BASE_CLASS.to_string(),
            parent: None,
            defaults: Config::new(),
            policy: Policy::Plain,
            schedulable: true,
            methods: MethodTable::root(execute),
        }
    }

    pub(crate) fn derive(spec: ClassSpec, parent: Arc<ClassDescriptor>, policy: Policy) -> Self {
        let defaults = crate::merge(parent.defaults.clone(), [&spec.defaults]);
        let methods = MethodTable::derive(&parent.methods, spec.execute, spec.methods);
        Self {
            name: spec.name,
            schedulable: spec.schedulable.unwrap_or(parent.schedulable),
            parent: Some(parent),
            defaults,
            policy,
            methods,
        }
    }

    /// Dotted class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class, `None` only for the root.
    pub fn parent(&self) -> Option<&Arc<ClassDescriptor>> {
        self.parent.as_ref()
    }

    /// Parent defaults merged with this class's own.
    pub fn defaults(&self) -> &Config {
        &self.defaults
    }

    /// Instantiation policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Whether constructions register with the scheduler.
    pub fn is_schedulable(&self) -> bool {
        self.schedulable
    }

    /// Resolved method table.
    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Whether this class is `ancestor` or descends from it.
    pub fn is_a(&self, ancestor: &str) -> bool {
        self.name == ancestor || self.parent.as_ref().is_some_and(|p| p.is_a(ancestor))
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("policy", &self.policy)
            .field("defaults", &self.defaults)
            .field("methods", &self.methods)
            .finish()
    }
}

/// Check that `name` is a dotted path of identifiers.
pub fn validate_name(name: &str) -> Result<(), ClassError> {
    let valid_segment = |seg: &str| {
        let mut chars = seg.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if name.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err(ClassError::InvalidName(name.to_string()))
    }
}

/// Enclosing path a nested name requires, e.g. `a.B` for `a.B.C`.
///
/// Two-segment names live directly under a top-level namespace and need
/// nothing registered.
pub(crate) fn required_namespace(name: &str) -> Option<&str> {
    if name.matches('.').count() < 2 {
        return None;
    }
    name.rsplit_once('.').map(|(ns, _)| ns)
}
