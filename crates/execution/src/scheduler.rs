//! Strictly ordered task scheduler.
//!
//! One FIFO queue, a readiness gate and a running flag. Draining removes the
//! head and runs its `execute`; the next task is only dequeued once the
//! running task signals completion through its [`Completion`] token.
//!
//! [`Completion`]: serialq_core::Completion

use crate::config::{DispatchMode, SchedulerConfig};
use serialq_core::{Dispatcher, Instance, InstanceId, TaskError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors from scheduler setup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The driver only exists in deferred mode
    #[error("scheduler uses immediate dispatch; there is no driver to spawn")]
    NotDeferred,

    /// `spawn_driver` was already called
    #[error("dispatch driver already spawned")]
    DriverTaken,

    /// No tokio runtime to spawn the driver on
    #[error("spawning the dispatch driver needs a running tokio runtime")]
    NoRuntime,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Instance>,
    running: bool,
    ready: bool,
    /// `start()` arrived before readiness
    start_pending: bool,
    /// Task dequeued whose completion has not arrived
    in_flight: Option<InstanceId>,
    /// A start signal was sent and has not been serviced yet
    kick_pending: bool,
    /// Immediate mode: a dispatch loop is active on some call stack
    dispatching: bool,
    /// Immediate mode: advance signals not yet serviced
    pending_advances: usize,
    last_error: Option<TaskError>,
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<State>,
    signals: Option<mpsc::UnboundedSender<()>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    running_tx: watch::Sender<bool>,
}

/// Ordered, single-flight task queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create an idle, not-ready scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        let (signals, receiver) = match config.dispatch {
            DispatchMode::Immediate => (None, None),
            DispatchMode::Deferred => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
        };
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                signals,
                receiver: Mutex::new(receiver),
                running_tx,
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// This scheduler as the registry-facing [`Dispatcher`].
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::new(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, running: bool) {
        self.inner.running_tx.send_replace(running);
    }

    /// Append a task to the tail of the queue.
    pub fn enqueue(&self, task: Instance) {
        let mut st = self.state();
        debug!(task = %task.id(), class = task.class_name(), position = st.queue.len(), "enqueued");
        st.queue.push_back(task);
    }

    /// Enqueue `task` and start draining.
    pub fn fire(&self, task: Instance) {
        self.enqueue(task);
        self.start();
    }

    /// Begin draining.
    ///
    /// Before readiness the intent is recorded and draining starts when
    /// [`set_ready`](Self::set_ready) is called. While running this is a no-op.
    pub fn start(&self) {
        let kick = {
            let mut st = self.state();
            if st.running {
                debug!("start ignored; already running");
                false
            } else if !st.ready {
                debug!("not ready; start deferred");
                st.start_pending = true;
                false
            } else {
                st.running = true;
                self.publish(true);
                info!(queued = st.queue.len(), "scheduler started");
                // a task still in flight from before a stop will advance us,
                // and so will a start signal the driver has not serviced
                let kick = st.in_flight.is_none() && !st.kick_pending;
                st.kick_pending |= kick;
                kick
            }
        };
        if kick {
            self.advance();
        }
    }

    /// Stop draining. Queued tasks stay queued; a task in flight still
    /// completes but its advance is ignored.
    pub fn stop(&self) {
        let mut st = self.state();
        st.start_pending = false;
        if st.running {
            st.running = false;
            self.publish(false);
            info!(queued = st.queue.len(), "scheduler stopped");
        }
    }

    /// Drop every task not yet started. A task in flight is unaffected.
    pub fn clear(&self) {
        let mut st = self.state();
        let dropped = st.queue.len();
        st.queue.clear();
        debug!(dropped, "queue cleared");
    }

    /// Number of queued tasks, the one in flight excluded.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.state().queue.is_empty()
    }

    /// Whether draining is active.
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Whether the readiness gate is open.
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    /// Task dequeued and awaiting its completion signal.
    pub fn in_flight(&self) -> Option<InstanceId> {
        self.state().in_flight
    }

    /// Error that halted the most recent drain, if any.
    pub fn last_error(&self) -> Option<TaskError> {
        self.state().last_error.clone()
    }

    /// Open or close the readiness gate. Opening it runs a start that was
    /// requested earlier. Repeated calls are harmless.
    pub fn set_ready(&self, ready: bool) {
        let resume = {
            let mut st = self.state();
            if st.ready != ready {
                debug!(ready, "readiness changed");
            }
            st.ready = ready;
            ready && std::mem::take(&mut st.start_pending)
        };
        if resume {
            info!("ready; running deferred start");
            self.start();
        }
    }

    /// Completion signal: dequeue and run the next task.
    ///
    /// Ignored while not running. Tasks normally reach this through their
    /// [`Completion`](serialq_core::Completion) token.
    pub fn advance(&self) {
        match &self.inner.signals {
            None => self.pump(),
            Some(signals) => {
                if signals.send(()).is_err() {
                    warn!("dispatch driver is gone; advance dropped");
                }
            }
        }
    }

    /// Resolve once draining is no longer active.
    ///
    /// Returns straight away if the scheduler is not running, including when
    /// a start is waiting on readiness.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.running_tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Spawn the deferred-mode driver on the current tokio runtime.
    pub fn spawn_driver(&self) -> Result<JoinHandle<()>, SchedulerError> {
        if self.inner.config.dispatch != DispatchMode::Deferred {
            return Err(SchedulerError::NotDeferred);
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut rx = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SchedulerError::DriverTaken)?;

        let weak = Arc::downgrade(&self.inner);
        Ok(handle.spawn(async move {
            while rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else { break };
                let scheduler = Scheduler { inner };
                let next = scheduler.take_next();
                if let Some(task) = next {
                    scheduler.dispatch(task);
                }
            }
            debug!("dispatch driver stopped");
        }))
    }

    /// Immediate mode: service advance signals without recursing.
    fn pump(&self) {
        {
            let mut st = self.state();
            st.pending_advances += 1;
            if st.dispatching {
                return;
            }
            st.dispatching = true;
        }
        loop {
            let next = {
                let mut st = self.state();
                if st.pending_advances == 0 {
                    st.dispatching = false;
                    return;
                }
                st.pending_advances -= 1;
                self.take_next_locked(&mut st)
            };
            if let Some(task) = next {
                self.dispatch(task);
            }
        }
    }

    fn take_next(&self) -> Option<Instance> {
        let mut st = self.state();
        self.take_next_locked(&mut st)
    }

    fn take_next_locked(&self, st: &mut State) -> Option<Instance> {
        st.in_flight = None;
        st.kick_pending = false;
        if !st.running {
            debug!("advance ignored; not running");
            return None;
        }
        match st.queue.pop_front() {
            Some(task) => {
                st.in_flight = Some(task.id());
                Some(task)
            }
            None => {
                st.running = false;
                self.publish(false);
                info!("queue drained");
                None
            }
        }
    }

    fn dispatch(&self, task: Instance) {
        debug!(task = %task.id(), class = task.class_name(), "executing");
        if let Err(err) = task.run(self.dispatcher()) {
            error!(
                task = %task.id(),
                class = task.class_name(),
                error = %err,
                "task raised a structural error; halting"
            );
            let mut st = self.state();
            st.running = false;
            st.in_flight = None;
            st.last_error = Some(err);
            self.publish(false);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Dispatcher for Scheduler {
    fn enqueue(&self, task: Instance) {
        Scheduler::enqueue(self, task);
    }

    fn advance(&self) {
        Scheduler::advance(self);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("Scheduler")
            .field("dispatch", &self.inner.config.dispatch)
            .field("queued", &st.queue.len())
            .field("running", &st.running)
            .field("ready", &st.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialq_core::{ClassRegistry, ClassSpec, Completion, Config, Status};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Registry with:
    /// - `t.Sync`: logs `exec`/`done` and advances immediately
    /// - `t.Held`: logs `exec` and parks its completion in `parked`
    /// - `t.Stuck`: logs `exec` and drops its completion
    /// - `t.Broken`: fails structurally
    struct Harness {
        scheduler: Scheduler,
        registry: ClassRegistry,
        log: Log,
        parked: Arc<Mutex<Vec<Completion>>>,
    }

    impl Harness {
        fn new(config: SchedulerConfig) -> Self {
            let scheduler = Scheduler::new(config);
            let registry = ClassRegistry::new(scheduler.dispatcher());
            let log: Log = Arc::default();
            let parked: Arc<Mutex<Vec<Completion>>> = Arc::default();

            let l = log.clone();
            registry
                .define(ClassSpec::new("t.Sync").execute(move |me: &Instance, done: Completion| {
                    let n = me.config().int("n").unwrap_or(-1);
                    l.lock().unwrap().push(format!("exec {}", n));
                    l.lock().unwrap().push(format!("done {}", n));
                    me.set_status(Status::Success);
                    done.advance();
                    Ok(())
                }))
                .unwrap();
            let (l, p) = (log.clone(), parked.clone());
            registry
                .define(ClassSpec::new("t.Held").execute(move |me: &Instance, done: Completion| {
                    let n = me.config().int("n").unwrap_or(-1);
                    l.lock().unwrap().push(format!("exec {}", n));
                    p.lock().unwrap().push(done);
                    Ok(())
                }))
                .unwrap();
            let l = log.clone();
            registry
                .define(ClassSpec::new("t.Stuck").execute(move |_: &Instance, done: Completion| {
                    l.lock().unwrap().push("exec stuck".to_string());
                    drop(done);
                    Ok(())
                }))
                .unwrap();
            registry
                .define(ClassSpec::new("t.Broken").execute(|me: &Instance, _done: Completion| {
                    me.config().require_str("url")?;
                    Ok(())
                }))
                .unwrap();

            Self {
                scheduler,
                registry,
                log,
                parked,
            }
        }

        fn immediate() -> Self {
            Self::new(SchedulerConfig::default())
        }

        fn add(&self, class: &str, n: i64) -> Instance {
            self.registry
                .construct(class, Config::new().with("n", n))
                .unwrap()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        /// Complete the oldest parked task.
        fn complete_one(&self) {
            let done = self.parked.lock().unwrap().remove(0);
            done.advance();
        }
    }

    #[test]
    fn test_fifo_ordering_sync_tasks() {
        let h = Harness::immediate();
        for n in 0..50 {
            h.add("t.Sync", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();

        let expected: Vec<String> = (0..50)
            .flat_map(|n| [format!("exec {}", n), format!("done {}", n)])
            .collect();
        assert_eq!(h.log(), expected);
        assert!(h.scheduler.is_empty());
        assert!(!h.scheduler.is_running());
    }

    #[test]
    fn test_next_task_waits_for_completion() {
        let h = Harness::immediate();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();

        assert_eq!(h.log(), vec!["exec 0"]);
        assert_eq!(h.scheduler.len(), 2);

        h.complete_one();
        assert_eq!(h.log(), vec!["exec 0", "exec 1"]);
        h.complete_one();
        h.complete_one();
        assert_eq!(h.log(), vec!["exec 0", "exec 1", "exec 2"]);
        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.in_flight(), None);
    }

    #[test]
    fn test_start_is_idempotent() {
        let h = Harness::immediate();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.start();
        h.scheduler.start();

        assert_eq!(h.log(), vec!["exec 0"]);
        assert_eq!(h.scheduler.len(), 2);
        for _ in 0..3 {
            h.complete_one();
        }
        assert_eq!(h.log(), vec!["exec 0", "exec 1", "exec 2"]);
    }

    #[test]
    fn test_clear_keeps_in_flight_task() {
        let h = Harness::immediate();
        for n in 0..4 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.clear();
        assert_eq!(h.scheduler.len(), 0);

        h.complete_one();
        assert_eq!(h.log(), vec!["exec 0"]);
        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.len(), 0);
    }

    #[test]
    fn test_non_compliant_task_freezes_queue() {
        let h = Harness::immediate();
        h.add("t.Stuck", 0);
        h.add("t.Sync", 1);
        h.add("t.Sync", 2);
        h.scheduler.set_ready(true);
        h.scheduler.start();

        assert_eq!(h.scheduler.len(), 2);
        assert!(h.scheduler.is_running());
        // restarting does not get past the stuck task
        h.scheduler.start();
        assert_eq!(h.scheduler.len(), 2);
        assert_eq!(h.log(), vec!["exec stuck"]);
    }

    #[test]
    fn test_readiness_gates_start() {
        let h = Harness::immediate();
        h.add("t.Sync", 0);
        h.add("t.Sync", 1);

        h.scheduler.start();
        assert!(!h.scheduler.is_running());
        assert!(h.log().is_empty());
        assert_eq!(h.scheduler.len(), 2);

        h.scheduler.set_ready(true);
        assert_eq!(h.log().len(), 4);
        assert!(h.scheduler.is_empty());

        // a second ready signal changes nothing
        h.scheduler.set_ready(true);
        assert_eq!(h.log().len(), 4);
    }

    #[test]
    fn test_stop_drops_deferred_start() {
        let h = Harness::immediate();
        h.add("t.Sync", 0);
        h.scheduler.start();
        h.scheduler.stop();
        h.scheduler.set_ready(true);
        assert!(h.log().is_empty());
        assert_eq!(h.scheduler.len(), 1);
    }

    #[test]
    fn test_stop_and_resume() {
        let h = Harness::immediate();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.stop();

        // completion while stopped is ignored
        h.complete_one();
        assert_eq!(h.log(), vec!["exec 0"]);
        assert_eq!(h.scheduler.len(), 2);

        h.scheduler.start();
        assert_eq!(h.log(), vec!["exec 0", "exec 1"]);
    }

    #[test]
    fn test_restart_while_in_flight_keeps_single_flight() {
        let h = Harness::immediate();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.stop();
        h.scheduler.start();

        assert_eq!(h.log(), vec!["exec 0"]);
        h.complete_one();
        assert_eq!(h.log(), vec!["exec 0", "exec 1"]);
    }

    #[test]
    fn test_advance_ignored_when_not_running() {
        let h = Harness::immediate();
        h.add("t.Sync", 0);
        h.scheduler.set_ready(true);
        h.scheduler.advance();
        assert!(h.log().is_empty());
        assert_eq!(h.scheduler.len(), 1);
    }

    #[test]
    fn test_structural_error_halts_drain() {
        let h = Harness::immediate();
        h.add("t.Broken", 0);
        h.add("t.Sync", 1);
        h.scheduler.set_ready(true);
        h.scheduler.start();

        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.len(), 1);
        assert!(matches!(h.scheduler.last_error(), Some(TaskError::Config(_))));

        h.scheduler.start();
        assert_eq!(h.log(), vec!["exec 1", "done 1"]);
    }

    #[test]
    fn test_long_sync_chain_does_not_recurse() {
        let h = Harness::immediate();
        for n in 0..20_000 {
            h.add("t.Sync", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        assert!(h.scheduler.is_empty());
        assert_eq!(h.log().len(), 40_000);
    }

    #[test]
    fn test_policies_against_scheduler() {
        let h = Harness::immediate();
        h.registry.define_singleton(ClassSpec::new("t.Shared")).unwrap();
        h.registry
            .define_multiton(ClassSpec::new("t.Many").extends("t.Sync"))
            .unwrap();

        h.registry.construct("t.Shared", Config::new()).unwrap();
        h.registry.construct("t.Shared", Config::new()).unwrap();
        assert_eq!(h.scheduler.len(), 0);

        h.registry.construct("t.Many", Config::new().with("n", 0)).unwrap();
        h.registry.construct("t.Many", Config::new().with("n", 1)).unwrap();
        assert_eq!(h.scheduler.len(), 2);

        h.scheduler.set_ready(true);
        h.scheduler.start();
        assert!(h
            .registry
            .instances("t.Many")
            .iter()
            .all(|i| i.status() == Some(Status::Success)));
    }

    #[test]
    fn test_fire_enqueues_and_starts() {
        let h = Harness::immediate();
        h.scheduler.set_ready(true);
        let shared = h.registry.define_singleton(ClassSpec::new("t.Once")).unwrap();
        let inst = h.registry.construct(shared.name(), Config::new()).unwrap();
        assert_eq!(h.scheduler.len(), 0);

        h.scheduler.fire(inst);
        assert!(h.scheduler.is_empty());
        assert!(!h.scheduler.is_running());
    }

    #[test]
    fn test_driver_errors() {
        let immediate = Scheduler::default();
        assert_eq!(immediate.spawn_driver().unwrap_err(), SchedulerError::NotDeferred);

        let deferred = Scheduler::new(SchedulerConfig::new().with_dispatch(DispatchMode::Deferred));
        assert_eq!(deferred.spawn_driver().unwrap_err(), SchedulerError::NoRuntime);
    }

    fn deferred() -> Harness {
        Harness::new(SchedulerConfig::new().with_dispatch(DispatchMode::Deferred))
    }

    #[tokio::test]
    async fn test_deferred_fifo_and_wait_idle() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        assert_eq!(h.scheduler.spawn_driver().unwrap_err(), SchedulerError::DriverTaken);

        for n in 0..10 {
            h.add("t.Sync", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.wait_idle().await;

        let expected: Vec<String> = (0..10)
            .flat_map(|n| [format!("exec {}", n), format!("done {}", n)])
            .collect();
        assert_eq!(h.log(), expected);
    }

    #[tokio::test]
    async fn test_deferred_dispatch_yields_to_host() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        h.add("t.Sync", 0);
        h.scheduler.set_ready(true);
        h.scheduler.start();

        // nothing runs until the driver gets a tick
        assert!(h.log().is_empty());
        h.scheduler.wait_idle().await;
        assert_eq!(h.log(), vec!["exec 0", "done 0"]);
    }

    #[tokio::test]
    async fn test_deferred_liveness_failure_is_permanent() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        h.add("t.Stuck", 0);
        for n in 1..5 {
            h.add("t.Sync", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.scheduler.len(), 4);
        assert!(h.scheduler.is_running());
        assert_eq!(h.log(), vec!["exec stuck"]);
    }

    /// Give the deferred driver a chance to service pending signals.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_deferred_restart_before_first_tick_keeps_single_flight() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.stop();
        h.scheduler.start();
        settle().await;

        assert_eq!(h.log(), vec!["exec 0"]);
        assert_eq!(h.parked.lock().unwrap().len(), 1);
        assert_eq!(h.scheduler.len(), 2);

        h.complete_one();
        settle().await;
        assert_eq!(h.log(), vec!["exec 0", "exec 1"]);
    }

    #[tokio::test]
    async fn test_deferred_stop_before_first_tick_then_resume() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        h.add("t.Held", 0);
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.stop();
        settle().await;
        assert!(h.log().is_empty());

        h.scheduler.start();
        settle().await;
        assert_eq!(h.log(), vec!["exec 0"]);
    }

    #[tokio::test]
    async fn test_deferred_stop_and_resume() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        settle().await;
        h.scheduler.stop();

        // completion while stopped is ignored
        h.complete_one();
        settle().await;
        assert_eq!(h.log(), vec!["exec 0"]);
        assert_eq!(h.scheduler.len(), 2);

        h.scheduler.start();
        settle().await;
        assert_eq!(h.log(), vec!["exec 0", "exec 1"]);
    }

    #[tokio::test]
    async fn test_deferred_restart_while_in_flight_keeps_single_flight() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        for n in 0..3 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        settle().await;
        h.scheduler.stop();
        h.scheduler.start();
        settle().await;

        assert_eq!(h.log(), vec!["exec 0"]);
        h.complete_one();
        settle().await;
        assert_eq!(h.log(), vec!["exec 0", "exec 1"]);
    }

    #[tokio::test]
    async fn test_deferred_clear_keeps_in_flight_task() {
        let h = deferred();
        let _driver = h.scheduler.spawn_driver().unwrap();
        for n in 0..4 {
            h.add("t.Held", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        settle().await;
        h.scheduler.clear();
        assert_eq!(h.scheduler.len(), 0);

        h.complete_one();
        h.scheduler.wait_idle().await;
        assert_eq!(h.log(), vec!["exec 0"]);
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_async_completion_from_spawned_task() {
        let h = Harness::immediate();
        let l = h.log.clone();
        h.registry
            .define(ClassSpec::new("t.Async").execute(move |me: &Instance, done: Completion| {
                let n = me.config().int("n").unwrap_or(-1);
                let l = l.clone();
                l.lock().unwrap().push(format!("exec {}", n));
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    l.lock().unwrap().push(format!("done {}", n));
                    done.advance();
                });
                Ok(())
            }))
            .unwrap();
        for n in 0..5 {
            h.add("t.Async", n);
        }
        h.scheduler.set_ready(true);
        h.scheduler.start();
        h.scheduler.wait_idle().await;

        let expected: Vec<String> = (0..5)
            .flat_map(|n| [format!("exec {}", n), format!("done {}", n)])
            .collect();
        assert_eq!(h.log(), expected);
    }
}
