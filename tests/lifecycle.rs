use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stratus::{Lifecycle, Runnable, ShutdownToken};

struct TickingWorker {
    ticks: Arc<AtomicUsize>,
}

impl Runnable for TickingWorker {
    fn name(&self) -> &'static str {
        "ticking_worker"
    }

    fn run(&mut self, token: &ShutdownToken) {
        while !token.wait_timeout(Duration::from_millis(5)) {
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[test]
fn stop_signals_and_joins_workers() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let mut lifecycle = Lifecycle::new();
    lifecycle.start(TickingWorker {
        ticks: Arc::clone(&ticks),
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while ticks.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(ticks.load(Ordering::Relaxed) >= 3);

    lifecycle.stop();
    let after_stop = ticks.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
}

#[test]
fn stop_hooks_run_in_reverse_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut lifecycle = Lifecycle::new();
    for name in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        lifecycle.on_stop(name, move || order.lock().unwrap().push(name));
    }
    lifecycle.stop();
    assert_eq!(order.lock().unwrap().as_slice(), &["third", "second", "first"]);
}

#[test]
fn token_wait_returns_early_on_signal() {
    let token = ShutdownToken::new();
    let waiter = {
        let token = token.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let observed = token.wait_timeout(Duration::from_secs(10));
            (observed, start.elapsed())
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    token.signal();
    let (observed, elapsed) = waiter.join().expect("waiter");
    assert!(observed);
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn stop_is_idempotent() {
    let mut lifecycle = Lifecycle::new();
    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = Arc::clone(&count);
        lifecycle.on_stop("counter", move || {
            count.fetch_add(1, Ordering::Relaxed);
        });
    }
    lifecycle.stop();
    lifecycle.stop();
    assert_eq!(count.load(Ordering::Relaxed), 1);
}
