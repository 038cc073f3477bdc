//! Execution layer - the ordered, single-flight task scheduler.

#![warn(missing_docs)]

pub mod config;
pub mod scheduler;

pub use config::{DispatchMode, SchedulerConfig};
pub use scheduler::{Scheduler, SchedulerError};
