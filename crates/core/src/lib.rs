//! serialq core: layered configuration, the class factory, and the task
//! contract the scheduler drives.
//!
//! Classes are defined by dotted name in a [`ClassRegistry`] with one of three
//! instantiation [`Policy`] values. Constructing an instance snapshots
//! `merge(parent defaults, class defaults, options)` and, for schedulable
//! classes, hands the instance to a [`Dispatcher`].

#![warn(missing_docs)]

mod id;
mod value;
mod merge;

mod class;
mod instance;
mod registry;
mod task;

pub use id::InstanceId;
pub use value::{Config, ConfigError, Func, FuncFn, Handle, Value};
pub use merge::{merge, resolve, INERT_FN_KEY};

pub use class::{
    validate_name, ClassDescriptor, ClassError, ClassSpec, ExecuteSlot, Method, MethodTable,
    Policy, BASE_CLASS,
};
pub use instance::{Instance, Status};
pub use registry::ClassRegistry;
pub use task::{BaseTask, Completion, Dispatcher, NullDispatcher, Task, TaskError};
