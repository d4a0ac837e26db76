use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Cooperative shutdown flag shared by every long-running component.
///
/// Registered as the SIGINT/SIGTERM target, so signal delivery and
/// programmatic shutdown look identical to the components.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    stop: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleeps in short slices until the timeout elapses or shutdown is
    /// signalled; returns true when shutdown was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_shutdown() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(Duration::from_millis(25)));
        }
        self.is_shutdown()
    }

    /// Hooks SIGINT and SIGTERM to this token.
    pub fn register_signals(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.stop))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.stop))?;
        Ok(())
    }
}

/// Long-running pipeline component started by the lifecycle coordinator.
pub trait Runnable: Send {
    fn name(&self) -> &'static str;

    /// Runs until completion or until the token signals shutdown.
    fn run(&mut self, token: &ShutdownToken);
}

struct LifecycleWorker {
    name: String,
    join: thread::JoinHandle<()>,
}

type StopHook = Box<dyn FnOnce() + Send>;

/// Starts each component on its own named thread, propagates cancellation,
/// runs stop hooks, and joins components in reverse start order.
pub struct Lifecycle {
    token: ShutdownToken,
    workers: Vec<LifecycleWorker>,
    stop_hooks: Vec<(String, StopHook)>,
    stopped: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            token: ShutdownToken::new(),
            workers: Vec::new(),
            stop_hooks: Vec::new(),
            stopped: false,
        }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn start(&mut self, mut runnable: impl Runnable + 'static) {
        let name = runnable.name().to_string();
        let token = self.token.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || runnable.run(&token))
            .expect("failed to spawn lifecycle worker");
        self.workers.push(LifecycleWorker { name, join });
    }

    /// Registers a hook invoked at shutdown, after the token is signalled
    /// and before threads are joined. Hooks run in reverse registration
    /// order.
    pub fn on_stop(&mut self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) {
        self.stop_hooks.push((name.into(), Box::new(hook)));
    }

    /// Blocks the caller until the token is signalled.
    pub fn wait_for_shutdown(&self) {
        while !self.token.is_shutdown() {
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Signals cancellation, fires stop hooks, and joins every worker in
    /// reverse start order.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.token.signal();
        while let Some((_, hook)) = self.stop_hooks.pop() {
            hook();
        }
        while let Some(worker) = self.workers.pop() {
            let _ = worker.join.join();
        }
    }

    /// Names of the workers still registered, in start order.
    pub fn worker_names(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|worker| worker.name.clone())
            .collect()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.stop();
    }
}
