//! Class registry: definition by dotted name and policy-aware construction.

use crate::class::{
    required_namespace, validate_name, ClassDescriptor, ClassError, ClassSpec, Policy, BASE_CLASS,
};
use crate::instance::{lock, Instance};
use crate::merge::merge;
use crate::task::{BaseTask, Dispatcher};
use crate::value::Config;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Keyed registry of classes plus the instances single/multi policies retain.
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, Arc<ClassDescriptor>>>,
    singletons: Mutex<HashMap<String, Instance>>,
    multitons: Mutex<HashMap<String, Vec<Instance>>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl ClassRegistry {
    /// Create a registry holding only [`BASE_CLASS`]. Schedulable
    /// constructions are handed to `dispatcher`.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        let mut classes = HashMap::new();
        classes.insert(
            BASE_CLASS.to_string(),
            Arc::new(ClassDescriptor::root(Arc::new(BaseTask))),
        );
        Self {
            classes: RwLock::new(classes),
            singletons: Mutex::new(HashMap::new()),
            multitons: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    /// Define a class whose constructions are always new instances.
    pub fn define(&self, spec: ClassSpec) -> Result<Arc<ClassDescriptor>, ClassError> {
        self.register(spec, Policy::Plain)
    }

    /// Define a class with at most one instance.
    pub fn define_singleton(&self, spec: ClassSpec) -> Result<Arc<ClassDescriptor>, ClassError> {
        self.register(spec, Policy::Single)
    }

    /// Define a class whose instances are all retained in construction order.
    pub fn define_multiton(&self, spec: ClassSpec) -> Result<Arc<ClassDescriptor>, ClassError> {
        self.register(spec, Policy::Multi)
    }

    fn register(&self, spec: ClassSpec, policy: Policy) -> Result<Arc<ClassDescriptor>, ClassError> {
        validate_name(&spec.name)?;

        let mut classes = self.classes.write().unwrap_or_else(|e| e.into_inner());
        if classes.contains_key(&spec.name) {
            return Err(ClassError::AlreadyDefined(spec.name));
        }
        if let Some(ns) = required_namespace(&spec.name) {
            if !classes.contains_key(ns) {
                return Err(ClassError::MissingNamespace {
                    name: spec.name.clone(),
                    namespace: ns.to_string(),
                });
            }
        }
        let parent_name = spec.parent.as_deref().unwrap_or(BASE_CLASS);
        validate_name(parent_name)?;
        let parent = classes
            .get(parent_name)
            .cloned()
            .ok_or_else(|| ClassError::UnknownClass(parent_name.to_string()))?;

        let descriptor = Arc::new(ClassDescriptor::derive(spec, parent, policy));
        debug!(
            class = descriptor.name(),
            parent = descriptor.parent().map(|p| p.name()).unwrap_or_default(),
            policy = %policy,
            "defined class"
        );
        classes.insert(descriptor.name().to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// Look up a class by dotted name.
    pub fn class(&self, name: &str) -> Result<Arc<ClassDescriptor>, ClassError> {
        validate_name(name)?;
        self.classes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ClassError::UnknownClass(name.to_string()))
    }

    /// All registered class names, sorted.
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .classes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Construct an instance of `name` with `options` over the class defaults.
    ///
    /// The class policy decides identity and scheduling:
    /// - plain: new instance, registered with the dispatcher
    /// - single: the existing instance if any (options discarded), never registered
    /// - multi: new instance, appended to the class registry and registered
    pub fn construct(&self, name: &str, options: Config) -> Result<Instance, ClassError> {
        let class = self.class(name)?;
        Ok(self.construct_from(class, options))
    }

    /// Construct a new instance of `instance`'s class from its configuration
    /// with `options` layered on top. `instance` is not modified.
    pub fn clone_instance(&self, instance: &Instance, options: Config) -> Instance {
        let config = merge(instance.config().clone(), [&options]);
        self.construct_from(instance.class().clone(), config)
    }

    fn construct_from(&self, class: Arc<ClassDescriptor>, options: Config) -> Instance {
        match class.policy() {
            Policy::Plain => {
                let instance = Self::instantiate(&class, &options);
                self.schedule(&instance);
                instance
            }
            Policy::Single => {
                let mut singletons = lock(&self.singletons);
                if let Some(existing) = singletons.get(class.name()) {
                    if !options.is_empty() {
                        debug!(class = class.name(), "singleton exists; options discarded");
                    }
                    return existing.clone();
                }
                let instance = Self::instantiate(&class, &options);
                singletons.insert(class.name().to_string(), instance.clone());
                instance
            }
            Policy::Multi => {
                let instance = Self::instantiate(&class, &options);
                lock(&self.multitons)
                    .entry(class.name().to_string())
                    .or_default()
                    .push(instance.clone());
                self.schedule(&instance);
                instance
            }
        }
    }

    fn instantiate(class: &Arc<ClassDescriptor>, options: &Config) -> Instance {
        let config = merge(class.defaults().clone(), [options]);
        let instance = Instance::new(class.clone(), config);
        debug!(task = %instance.id(), class = class.name(), "constructed");
        instance
    }

    fn schedule(&self, instance: &Instance) {
        if instance.class().is_schedulable() {
            self.dispatcher.enqueue(instance.clone());
        }
    }

    /// The instance of a single-policy class, once constructed.
    pub fn singleton(&self, name: &str) -> Option<Instance> {
        lock(&self.singletons).get(name).cloned()
    }

    /// Every instance of a multi-policy class, in construction order.
    pub fn instances(&self, name: &str) -> Vec<Instance> {
        lock(&self.multitons).get(name).cloned().unwrap_or_default()
    }

    /// The `index`-th constructed instance of a multi-policy class.
    pub fn instance_at(&self, name: &str, index: usize) -> Option<Instance> {
        lock(&self.multitons).get(name).and_then(|v| v.get(index).cloned())
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.class_names())
            .finish()
    }
}
