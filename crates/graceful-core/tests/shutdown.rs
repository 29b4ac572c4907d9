use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use graceful_core::{Outcome, Switch};

/// Delegated-mode switch without an OS subscription.
fn test_switch(timeout: Duration) -> (Switch, mpsc::Receiver<Outcome>) {
    let (tx, rx) = mpsc::channel();
    let switch = Switch::builder(timeout).without_signals().done(tx).build();
    (switch, rx)
}

fn counter_task(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
    let counter = counter.clone();
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// A task that outlives any timeout used here.
fn stuck() {
    thread::sleep(Duration::from_secs(5));
}

#[test]
fn concurrent_triggers_run_once() {
    let (switch, rx) = test_switch(Duration::from_secs(1));
    let calls = Arc::new(AtomicUsize::new(0));
    switch.on_shutdown("only", counter_task(&calls));

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let switch = switch.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                switch.shutdown();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(rx.recv().unwrap(), Outcome::Clean);
    assert!(rx.recv().is_err(), "exactly one outcome is delivered");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn every_task_runs_even_on_timeout() {
    let (switch, _rx) = test_switch(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    for name in ["a", "b", "c", "d"] {
        switch.on_shutdown(name, counter_task(&calls));
    }
    let c = calls.clone();
    switch.on_shutdown("stuck", move || {
        c.fetch_add(1, Ordering::SeqCst);
        stuck();
    });

    switch.shutdown();
    let outcome = switch.wait();

    assert_eq!(outcome, Outcome::Timeout(vec!["stuck".to_string()]));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn timeout_reports_only_stuck_task() {
    let (switch, _rx) = test_switch(Duration::from_millis(100));
    switch.on_shutdown("b", stuck);
    switch.on_shutdown("a", || {});
    switch.on_shutdown("c", || {});

    switch.shutdown();
    assert_eq!(switch.wait(), Outcome::Timeout(vec!["b".to_string()]));
}

#[test]
fn timeout_report_is_sorted() {
    let (switch, rx) = test_switch(Duration::from_millis(50));
    for name in ["z", "x", "y"] {
        switch.on_shutdown(name, stuck);
    }

    switch.shutdown();
    let expected = Outcome::Timeout(vec!["x".into(), "y".into(), "z".into()]);
    assert_eq!(rx.recv().unwrap(), expected);
    assert_eq!(
        expected.into_result().unwrap_err().to_string(),
        "shutdown timeout, tasks left: x, y, z"
    );
}

#[test]
fn fast_tasks_complete_cleanly() {
    let timeout = Duration::from_secs(1);
    let (switch, _rx) = test_switch(timeout);
    for name in ["one", "two", "three"] {
        switch.on_shutdown(name, || thread::sleep(Duration::from_millis(1)));
    }

    let started = Instant::now();
    switch.shutdown();
    assert_eq!(switch.wait(), Outcome::Clean);
    assert!(
        started.elapsed() < timeout / 2,
        "clean shutdown took {:?}",
        started.elapsed()
    );
}

#[test]
fn late_registration_is_not_run() {
    let (switch, _rx) = test_switch(Duration::from_secs(2));
    let (started_tx, started_rx) = mpsc::channel();
    let late_calls = Arc::new(AtomicUsize::new(0));

    switch.on_shutdown("early", move || {
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    switch.shutdown();
    // The early task runs, so the snapshot has been taken.
    started_rx.recv().unwrap();
    switch.on_shutdown("late", counter_task(&late_calls));

    assert_eq!(switch.wait(), Outcome::Clean);
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    // only the late task is left behind, the run consumed the rest
    assert_eq!(switch.task_count(), 1);
}

#[test]
fn unconstructed_switch_fails_fast() {
    let switch = Switch::default();
    let result = thread::spawn(move || switch.on_shutdown("db", || {})).join();
    let panic = result.unwrap_err();
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or_default();
    assert!(message.contains("not initialized"), "got {message:?}");
}

#[test]
fn wait_is_repeatable() {
    let (switch, _rx) = test_switch(Duration::from_millis(30));
    switch.on_shutdown("stuck", stuck);

    let waiter = {
        let switch = switch.clone();
        thread::spawn(move || switch.wait())
    };
    switch.shutdown();

    let first = waiter.join().unwrap();
    let second = switch.wait();
    let third = switch.wait_timeout(Duration::from_millis(1));

    assert_eq!(first, Outcome::Timeout(vec!["stuck".to_string()]));
    assert_eq!(first, second);
    assert_eq!(third, Some(second));
}

#[test]
fn wait_timeout_before_trigger() {
    let (switch, _rx) = test_switch(Duration::from_secs(1));
    assert_eq!(switch.wait_timeout(Duration::from_millis(20)), None);
    assert_eq!(switch.outcome(), None);
}

#[test]
fn panicking_task_does_not_break_run() {
    let (switch, _rx) = test_switch(Duration::from_secs(1));
    let calls = Arc::new(AtomicUsize::new(0));
    switch.on_shutdown("boom", || panic!("close failed"));
    switch.on_shutdown("fine", counter_task(&calls));

    switch.shutdown();
    assert_eq!(switch.wait(), Outcome::Clean);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn dropped_receiver_still_completes() {
    let (switch, rx) = test_switch(Duration::from_secs(1));
    drop(rx);
    switch.on_shutdown("a", || {});
    switch.shutdown();
    assert_eq!(switch.wait(), Outcome::Clean);
}

#[test]
fn task_may_consume_its_resource() {
    struct Connection {
        closed: mpsc::Sender<&'static str>,
    }
    impl Connection {
        fn close(self) {
            self.closed.send("closed").unwrap();
        }
    }

    let (switch, _rx) = test_switch(Duration::from_secs(1));
    let (closed_tx, closed_rx) = mpsc::channel();
    let conn = Connection { closed: closed_tx };
    switch.on_shutdown("close_db", move || conn.close());

    switch.shutdown();
    assert_eq!(switch.wait(), Outcome::Clean);
    assert_eq!(closed_rx.recv().unwrap(), "closed");
}

#[test]
fn unbounded_timeout_still_delivers() {
    let (switch, rx) = test_switch(Duration::MAX);
    switch.on_shutdown("noop", || {});
    switch.shutdown();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        Outcome::Clean
    );
    assert_eq!(switch.wait_timeout(Duration::MAX), Some(Outcome::Clean));
}

#[test]
fn task_may_trigger_its_own_switch() {
    let (switch, _rx) = test_switch(Duration::from_secs(1));
    let inner = switch.clone();
    switch.on_shutdown("reentrant", move || inner.shutdown());

    switch.shutdown();
    assert_eq!(switch.wait(), Outcome::Clean);
}
