//! Graceful shutdown switch.
//!
//! A [`Switch`] listens for termination signals, keeps a registry of named
//! cleanup tasks and, once triggered, runs all of them concurrently under a
//! single deadline:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let switch = graceful_core::Switch::new(Duration::from_secs(1));
//! switch.on_shutdown("close_db", || {
//!     // close connections, log failures
//! });
//! switch.wait(); // default mode exits the process once tasks are done
//! ```
//!
//! Tasks are not cancelled on timeout. The switch stops waiting and reports
//! who was still running; stuck threads keep going in the background.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::completion::{self, Completion, Delivery};
use crate::outcome::Outcome;
use crate::registry::{Task, TaskRegistry};
use crate::signals::{DEFAULT_SIGNALS, Subscription, signal_name};
use crate::tracker::{ActiveGuard, ActiveTasks};

const NOT_INITIALIZED: &str = "graceful: switch is not initialized, use Switch::new";

/// Observable lifecycle of a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Waiting for a signal or [`Switch::shutdown`].
    Idle,
    /// Tasks are running.
    Running,
    /// Terminal.
    Completed(Outcome),
}

/// Handle to a shutdown coordinator. Clones share the same state.
///
/// `Switch::default()` is an unarmed handle: every operation on it panics,
/// so a missing construction is caught on first use instead of silently
/// dropping cleanup work.
#[derive(Clone, Default)]
pub struct Switch {
    inner: Option<Arc<Inner>>,
}

/// Non-owning handle to a [`Switch`], for collaborators that the switch's
/// own tasks keep alive.
#[derive(Clone)]
pub struct WeakSwitch {
    inner: Weak<Inner>,
}

impl WeakSwitch {
    /// The switch, unless every strong handle was dropped.
    pub fn upgrade(&self) -> Option<Switch> {
        self.inner.upgrade().map(|inner| Switch { inner: Some(inner) })
    }
}

struct Inner {
    timeout: Duration,
    signals: Vec<c_int>,
    tasks: Mutex<TaskRegistry>,
    triggered: Arc<AtomicBool>,
    subscription: Option<Subscription>,
    delivery: Mutex<Option<Delivery>>,
    completion: Completion,
}

/// Construction options for [`Switch`].
pub struct SwitchBuilder {
    timeout: Duration,
    signals: Option<Vec<c_int>>,
    done: Option<Sender<Outcome>>,
    listen: bool,
    force_exit_on_repeat: bool,
}

impl SwitchBuilder {
    /// Interrupts to react to. Empty or unset means SIGTERM and SIGINT.
    pub fn signals(mut self, signals: impl IntoIterator<Item = c_int>) -> Self {
        self.signals = Some(signals.into_iter().collect());
        self
    }

    /// Deliver the outcome to `tx` instead of exiting the process.
    ///
    /// The sender is dropped after the single send, closing the channel.
    pub fn done(mut self, tx: Sender<Outcome>) -> Self {
        self.done = Some(tx);
        self
    }

    /// Skip the OS subscription; only [`Switch::shutdown`] triggers.
    pub fn without_signals(mut self) -> Self {
        self.listen = false;
        self
    }

    /// Exit with status 130 if an interrupt arrives after the switch was
    /// triggered.
    pub fn force_exit_on_repeat(mut self, enabled: bool) -> Self {
        self.force_exit_on_repeat = enabled;
        self
    }

    pub fn build(self) -> Switch {
        let signals = match self.signals {
            Some(signals) if !signals.is_empty() => signals,
            _ => DEFAULT_SIGNALS.to_vec(),
        };
        let triggered = Arc::new(AtomicBool::new(false));
        let delivery = match self.done {
            Some(tx) => Delivery::Sink(tx),
            None => Delivery::Exit,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let subscription = if self.listen {
                subscribe(
                    &signals,
                    WeakSwitch {
                        inner: weak.clone(),
                    },
                    self.force_exit_on_repeat.then(|| Arc::clone(&triggered)),
                )
            } else {
                None
            };

            Inner {
                timeout: self.timeout,
                signals,
                tasks: Mutex::new(TaskRegistry::new()),
                triggered,
                subscription,
                delivery: Mutex::new(Some(delivery)),
                completion: Completion::default(),
            }
        });

        log::debug!(
            "Shutdown switch ready: timeout={:?}, signals={:?}",
            inner.timeout,
            inner.signal_names()
        );

        Switch { inner: Some(inner) }
    }
}

/// Listen on `signals`, triggering the switch behind `weak` on arrival.
///
/// Subscription failures are logged; the switch then only reacts to
/// programmatic triggers.
fn subscribe(
    signals: &[c_int],
    weak: WeakSwitch,
    repeat_exit: Option<Arc<AtomicBool>>,
) -> Option<Subscription> {
    let listener = Subscription::listen(signals, move |sig| {
        let Some(switch) = weak.upgrade() else {
            return;
        };
        log::info!(
            "Received {}, shutting down",
            signal_name(sig).unwrap_or("signal")
        );
        switch.shutdown();
    });

    let mut subscription = match listener {
        Ok(subscription) => subscription,
        Err(e) => {
            log::warn!("Failed to subscribe to signals {signals:?}: {e}");
            return None;
        }
    };

    if let Some(armed) = repeat_exit {
        if let Err(e) = subscription.exit_on_repeat(signals, armed) {
            log::warn!("Failed to register forced exit on repeated signal: {e}");
        }
    }

    Some(subscription)
}

impl Switch {
    /// Default-mode switch: reacts to SIGTERM and SIGINT, and exits the
    /// process when shutdown completes.
    pub fn new(timeout: Duration) -> Self {
        Self::builder(timeout).build()
    }

    pub fn builder(timeout: Duration) -> SwitchBuilder {
        SwitchBuilder {
            timeout,
            signals: None,
            done: None,
            listen: true,
            force_exit_on_repeat: false,
        }
    }

    fn inner(&self) -> &Arc<Inner> {
        match &self.inner {
            Some(inner) => inner,
            None => panic!("{NOT_INITIALIZED}"),
        }
    }

    pub fn downgrade(&self) -> WeakSwitch {
        WeakSwitch {
            inner: Arc::downgrade(self.inner()),
        }
    }

    /// Register a named task to run on shutdown, replacing any task with
    /// the same name.
    ///
    /// Each task runs at most once. A task registered after the run has
    /// taken its snapshot is not run.
    pub fn on_shutdown(&self, name: impl Into<String>, task: impl FnOnce() + Send + 'static) {
        let inner = self.inner();
        let name = name.into();
        assert!(!name.is_empty(), "graceful: task name must not be empty");

        if inner.triggered.load(Ordering::SeqCst) {
            log::warn!("Task {name} registered after shutdown was triggered, it may not run");
        }
        if inner.lock_tasks().insert(name.clone(), Box::new(task)) {
            log::debug!("Replaced shutdown task {name}");
        } else {
            log::debug!("Registered shutdown task {name}");
        }
    }

    /// Trigger the switch and stop listening to OS signals.
    ///
    /// Only the first call starts the run; it happens on a background
    /// thread, so this never blocks.
    pub fn shutdown(&self) {
        let inner = self.inner();
        if inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = &inner.subscription {
            subscription.close();
        }

        let run = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name("graceful-shutdown".into())
            .spawn(move || run.run());
        if let Err(e) = spawned {
            log::error!("Failed to spawn shutdown thread, running inline: {e}");
            inner.run();
        }
    }

    /// Block until the run has finished and its outcome was delivered.
    ///
    /// In default mode the process exits before this returns.
    pub fn wait(&self) -> Outcome {
        self.inner().completion.wait()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        self.inner().completion.wait_timeout(timeout)
    }

    /// Outcome of the run, if it finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner().completion.get()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner().triggered.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> State {
        let inner = self.inner();
        match inner.completion.get() {
            Some(outcome) => State::Completed(outcome),
            None if inner.triggered.load(Ordering::SeqCst) => State::Running,
            None => State::Idle,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner().timeout
    }

    /// Interrupts this switch reacts to.
    pub fn signals(&self) -> &[c_int] {
        &self.inner().signals
    }

    /// Whether an OS subscription is live.
    pub fn is_listening(&self) -> bool {
        self.inner()
            .subscription
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Number of registered tasks not yet handed to a run.
    pub fn task_count(&self) -> usize {
        self.inner().lock_tasks().len()
    }
}

impl Inner {
    fn lock_tasks(&self) -> MutexGuard<'_, TaskRegistry> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_names(&self) -> Vec<&'static str> {
        self.signals
            .iter()
            .map(|&sig| signal_name(sig).unwrap_or("?"))
            .collect()
    }

    fn run(&self) {
        let started = Instant::now();
        let deadline = started.checked_add(self.timeout);
        let tasks = self.lock_tasks().take();

        log::info!(
            "Running {} shutdown task(s), timeout {:?}",
            tasks.len(),
            self.timeout
        );

        let active = ActiveTasks::new();
        for (name, task) in tasks {
            let guard = active.enter(&name);
            launch(task, guard, |job| {
                std::thread::Builder::new()
                    .name(format!("shutdown-{name}"))
                    .spawn(job)
                    .map(drop)
            });
        }

        let outcome = active.wait_until(deadline);
        match &outcome {
            Outcome::Clean => log::info!("Shutdown tasks finished in {:?}", started.elapsed()),
            Outcome::Timeout(names) => log::warn!(
                "Shutdown timed out after {:?}, tasks left: {}",
                self.timeout,
                names.join(", ")
            ),
        }

        self.deliver(outcome);
    }

    fn deliver(&self, outcome: Outcome) {
        let delivery = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match delivery {
            Some(Delivery::Exit) => completion::exit_with(&outcome),
            Some(Delivery::Sink(tx)) => {
                self.completion.set(outcome.clone());
                if tx.send(outcome).is_err() {
                    log::debug!("Completion receiver dropped before delivery");
                }
            }
            None => {
                self.completion.set(outcome);
            }
        }
    }
}

type Job = Arc<Mutex<Option<(Task, ActiveGuard)>>>;

fn take_job(job: &Job) -> Option<(Task, ActiveGuard)> {
    job.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn run_task(task: Task, guard: ActiveGuard) {
    let started = Instant::now();
    task();
    log::debug!("Task {} finished in {:?}", guard.name(), started.elapsed());
}

/// Hand `task` to `spawn`; if no thread can be started, run it on the
/// current thread so it still runs exactly once.
fn launch<S>(task: Task, guard: ActiveGuard, spawn: S)
where
    S: FnOnce(Box<dyn FnOnce() + Send>) -> std::io::Result<()>,
{
    let job: Job = Arc::new(Mutex::new(Some((task, guard))));
    let spawned = Arc::clone(&job);
    let result = spawn(Box::new(move || {
        if let Some((task, guard)) = take_job(&spawned) {
            run_task(task, guard);
        }
    }));

    if let Err(e) = result {
        if let Some((task, guard)) = take_job(&job) {
            log::error!("Failed to start shutdown task {}, running inline: {e}", guard.name());
            run_task(task, guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn quiet_switch(timeout: Duration) -> (Switch, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        let switch = Switch::builder(timeout).without_signals().done(tx).build();
        (switch, rx)
    }

    #[test]
    fn default_signals_when_unset_or_empty() {
        let (switch, _rx) = quiet_switch(Duration::from_secs(1));
        assert_eq!(switch.signals(), DEFAULT_SIGNALS);

        let (tx, _rx) = mpsc::channel();
        let switch = Switch::builder(Duration::from_secs(1))
            .without_signals()
            .signals([])
            .done(tx)
            .build();
        assert_eq!(switch.signals(), DEFAULT_SIGNALS);
    }

    #[test]
    fn state_transitions() {
        let (switch, rx) = quiet_switch(Duration::from_secs(1));
        assert_eq!(switch.state(), State::Idle);
        assert!(!switch.is_triggered());

        switch.shutdown();
        assert!(switch.is_triggered());
        assert_eq!(rx.recv().unwrap(), Outcome::Clean);
        assert_eq!(switch.state(), State::Completed(Outcome::Clean));
    }

    #[test]
    fn no_tasks_is_clean() {
        let (switch, rx) = quiet_switch(Duration::from_millis(10));
        switch.shutdown();
        assert_eq!(switch.wait(), Outcome::Clean);
        assert_eq!(rx.recv().unwrap(), Outcome::Clean);
        assert!(rx.recv().is_err(), "channel must be closed after delivery");
    }

    #[test]
    fn overwritten_task_runs_once() {
        let (switch, _rx) = quiet_switch(Duration::from_secs(1));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        switch.on_shutdown("db", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        switch.on_shutdown("db", move || {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(switch.task_count(), 1);

        switch.shutdown();
        assert_eq!(switch.wait(), Outcome::Clean);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_timeout_reports_running_task() {
        let (switch, _rx) = quiet_switch(Duration::ZERO);
        switch.on_shutdown("slow", || std::thread::sleep(Duration::from_millis(200)));
        switch.shutdown();
        assert_eq!(switch.wait(), Outcome::Timeout(vec!["slow".to_string()]));
    }

    #[test]
    fn unbounded_timeout_waits_for_tasks() {
        let (switch, rx) = quiet_switch(Duration::MAX);
        switch.on_shutdown("flush", || std::thread::sleep(Duration::from_millis(20)));
        switch.shutdown();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Outcome::Clean
        );
        assert_eq!(switch.wait_timeout(Duration::MAX), Some(Outcome::Clean));
    }

    #[test]
    fn failed_spawn_runs_task_inline() {
        let active = ActiveTasks::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        launch(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            active.enter("inline"),
            |_job| Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads")),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(active.is_empty());
    }

    #[test]
    fn spawned_task_runs_once() {
        let active = ActiveTasks::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        launch(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            active.enter("threaded"),
            |job| {
                std::thread::spawn(job)
                    .join()
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "task panicked"))
            },
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(active.is_empty());
    }

    #[test]
    fn weak_handle_does_not_keep_switch_alive() {
        let (switch, _rx) = quiet_switch(Duration::from_secs(1));
        let weak = switch.downgrade();
        assert!(weak.upgrade().is_some());
        drop(switch);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_name_panics() {
        let (switch, _rx) = quiet_switch(Duration::from_secs(1));
        switch.on_shutdown("", || {});
    }

    #[test]
    #[should_panic(expected = "not initialized")]
    fn unarmed_shutdown_panics() {
        Switch::default().shutdown();
    }

    #[test]
    fn listening_stops_on_trigger() {
        let (tx, _rx) = mpsc::channel();
        let switch = Switch::builder(Duration::from_secs(1))
            .signals([signal_hook::consts::SIGUSR2])
            .done(tx)
            .build();
        assert!(switch.is_listening());

        switch.shutdown();
        assert!(!switch.is_listening());
        switch.wait();
    }
}
