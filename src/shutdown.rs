//! Graceful shutdown (spec §5): a `watch`-based broadcast so long-lived
//! loops (cron poll, channel sweeper, batch/task workers) notice a stop
//! request, plus an ordered registry of per-subsystem `stop` hooks run in
//! reverse registration order, each bounded by a grace period.
//!
//! Grounded on the teacher's `daemon.rs` shutdown broadcast
//! (`watch::channel(false)` handed to every long-lived task), trimmed of
//! the PID-file/IPC-socket daemonization and OTLP exporter flush this
//! crate has no use for — subsystems here are stopped in-process rather
//! than over a Unix socket.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

type StopHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Registers subsystem shutdown hooks and runs them in reverse order on
/// [`Shutdown::run`], each given up to `grace_period` to finish.
pub struct Shutdown {
    notify: watch::Sender<bool>,
    hooks: Vec<(&'static str, StopHook)>,
    grace_period: Duration,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self { notify, hooks: Vec::new(), grace_period: DEFAULT_GRACE_PERIOD }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// A receiver long-lived loops can `select!` on alongside their own
    /// work; fires once `run` is called.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }

    /// Registers a subsystem's `stop` hook. Hooks run in reverse of
    /// registration order, so register dependencies first and the things
    /// that depend on them last — the HTTP listener should be the last
    /// thing registered so it's the first thing stopped, well before the
    /// schedulers and stores it sits in front of.
    pub fn register<F, Fut>(&mut self, name: &'static str, stop: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.push((name, Box::new(move || Box::pin(stop()))));
    }

    /// Broadcasts the shutdown signal, then runs every registered hook in
    /// reverse order, each bounded by the grace period. A hook that times
    /// out is logged and skipped rather than blocking the rest.
    pub async fn run(mut self) {
        let _ = self.notify.send(true);

        while let Some((name, hook)) = self.hooks.pop() {
            tracing::info!(subsystem = name, "shutting down");
            match tokio::time::timeout(self.grace_period, hook()).await {
                Ok(()) => tracing::info!(subsystem = name, "shut down cleanly"),
                Err(_) => tracing::warn!(subsystem = name, grace_period = ?self.grace_period, "shutdown timed out"),
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once either SIGINT or (on unix) SIGTERM is observed.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn hooks_run_in_reverse_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut shutdown = Shutdown::new();

        let o1 = order.clone();
        shutdown.register("first", move || async move {
            o1.lock().unwrap().push("first");
        });
        let o2 = order.clone();
        shutdown.register("second", move || async move {
            o2.lock().unwrap().push("second");
        });

        shutdown.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn subscribe_observes_the_shutdown_signal() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());

        shutdown.run().await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn a_hung_hook_times_out_without_blocking_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut shutdown = Shutdown::new().with_grace_period(Duration::from_millis(20));

        shutdown.register("slow", || async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let r = ran.clone();
        shutdown.register("fast", move || async move {
            r.fetch_add(1, Ordering::SeqCst);
        });

        shutdown.run().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
