use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Touching this file stops the experiment from outside the process.
pub const DEFAULT_SENTINEL_PATH: &str = "/tmp/chaos-emergency-stop";

const SENTINEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A cleanup hook run when the emergency controller fires.
#[async_trait]
pub trait StopListener: Send + Sync {
    async fn on_stop(&self) -> anyhow::Result<()>;
}

/// Watches for the emergency sentinel file and termination signals.
///
/// On the first trigger from either source it cancels the stop token and
/// runs registered listeners sequentially, exactly once; later triggers are
/// no-ops. Listener errors are logged and never stop the remaining
/// listeners.
pub struct EmergencyController {
    sentinel: PathBuf,
    listeners: Mutex<Vec<Arc<dyn StopListener>>>,
    fired: AtomicBool,
    stop: CancellationToken,
}

impl EmergencyController {
    pub fn new(sentinel: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            sentinel: sentinel.into(),
            listeners: Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
            stop: CancellationToken::new(),
        })
    }

    /// Token cancelled on the first trigger; the orchestrator's waits
    /// subscribe to it.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn register(&self, listener: Arc<dyn StopListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Spawn the two watcher tasks (sentinel poll + signal handler).
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let poller = {
            let this = self.clone();
            tokio::spawn(async move { this.poll_sentinel().await })
        };
        let signals = tokio::spawn(async move { self.watch_signals().await });
        vec![poller, signals]
    }

    async fn poll_sentinel(self: Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }
            if self.sentinel.exists() {
                self.trigger("emergency-stop sentinel file present").await;
                return;
            }
            tokio::time::sleep(SENTINEL_POLL_INTERVAL).await;
        }
    }

    async fn watch_signals(self: Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => self.trigger("interrupt signal").await,
                _ = term.recv() => self.trigger("terminate signal").await,
                _ = self.stop.cancelled() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => self.trigger("interrupt signal").await,
                _ = self.stop.cancelled() => {}
            }
        }
    }

    /// Fire at most once: cancel the token, then run listeners in
    /// registration order.
    pub async fn trigger(&self, reason: &str) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "EMERGENCY STOP");
        self.stop.cancel();

        let listeners: Vec<Arc<dyn StopListener>> = self.listeners.lock().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_stop().await {
                error!(error = %e, "stop listener failed");
            }
        }
        info!("emergency cleanup listeners finished");
    }
}
