//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// When the next task runs after an advance signal.
///
/// Ordering is identical in both modes; only the call stack and the point at
/// which the host regains control differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run the next task within the same turn as the signal. Signals raised
    /// while a task is being dispatched are serviced by the outer dispatch
    /// loop, so synchronous chains do not grow the stack.
    #[default]
    Immediate,
    /// Queue the signal for the dispatch driver, which runs the next task on
    /// a later tick of the tokio runtime.
    Deferred,
}

/// Configuration for the [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch timing
    pub dispatch: DispatchMode,
}

impl SchedulerConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dispatch timing.
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_immediate() {
        assert_eq!(SchedulerConfig::default().dispatch, DispatchMode::Immediate);
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new().with_dispatch(DispatchMode::Deferred);
        assert_eq!(config.dispatch, DispatchMode::Deferred);
    }

    #[test]
    fn test_deserialize_lowercase() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"dispatch":"deferred"}"#).unwrap();
        assert_eq!(config.dispatch, DispatchMode::Deferred);
    }
}
