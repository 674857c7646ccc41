//! Post-success watchdog.
//!
//! Hosts keep re-rendering after the first successful reconcile: regions get
//! replaced, duplicated or wiped a second or two later. After a success the
//! watchdog re-runs the reconciler on a fixed interval until the view has
//! been quiet for long enough.
//!
//! ```text
//! start(focus) ──► tick ──► reconcile ──► work found?  ── yes ──► stable = 0
//!                   ▲                        │ no
//!                   │                        ▼
//!                   └──────────────────── stable += 1
//!
//! stops on: stable ≥ threshold with data cached │ tick ceiling │ focus change │ cancel
//! ```

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::WatchdogConfig;
use crate::reconcile::Reconciler;

/// Why a watchdog session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogStop {
    Stable,
    FocusChanged,
    TickCeiling,
    Cancelled,
}

impl std::fmt::Display for WatchdogStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::FocusChanged => write!(f, "focus changed"),
            Self::TickCeiling => write!(f, "tick ceiling"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Counters of one watchdog run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogSession {
    pub focus_key: String,
    pub ticks: u32,
    pub stable_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogReport {
    pub session: WatchdogSession,
    pub reason: WatchdogStop,
}

struct Running {
    focus_key: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<WatchdogReport>,
}

struct WatchdogInner {
    reconciler: Arc<Reconciler>,
    config: WatchdogConfig,
    current: Mutex<Option<Running>>,
}

/// Handle to the watchdog; clones share one running session.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.inner.config)
            .field("watching", &self.watching())
            .finish()
    }
}

impl Watchdog {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>, config: WatchdogConfig) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                reconciler,
                config,
                current: Mutex::new(None),
            }),
        }
    }

    /// Start watching `focus_key`, cancelling any previous session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, focus_key: &str) {
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            Arc::clone(&self.inner.reconciler),
            self.inner.config.clone(),
            focus_key.to_string(),
            cancel_rx,
        ));

        let previous = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Running {
                focus_key: focus_key.to_string(),
                cancel,
                handle,
            });
        if let Some(previous) = previous {
            let _ = previous.cancel.send(true);
        }
        info!(identity = focus_key, "Watchdog started");
    }

    /// Focus key of the session still running, if any.
    #[must_use]
    pub fn watching(&self) -> Option<String> {
        let current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
        current
            .as_ref()
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.focus_key.clone())
    }

    #[must_use]
    pub fn is_watching(&self, focus_key: &str) -> bool {
        self.watching().as_deref() == Some(focus_key)
    }

    /// Ask the running session to stop at once.
    pub fn stop(&self) {
        let current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = current.as_ref() {
            let _ = running.cancel.send(true);
        }
    }

    /// Wait for the latest session to end and return its report.
    pub async fn join(&self) -> Option<WatchdogReport> {
        let running = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        // Keep the sender alive until the loop has finished on its own.
        let Running { cancel, handle, .. } = running;
        let report = handle.await.ok();
        drop(cancel);
        report
    }
}

async fn run(
    reconciler: Arc<Reconciler>,
    config: WatchdogConfig,
    focus_key: String,
    mut cancel: watch::Receiver<bool>,
) -> WatchdogReport {
    let period = config.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut session = WatchdogSession {
        focus_key,
        ticks: 0,
        stable_ticks: 0,
    };

    let reason = loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                // A dropped handle counts as cancellation too.
                if changed.is_err() || *cancel.borrow() {
                    break WatchdogStop::Cancelled;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        session.ticks += 1;
        // Never fetch for or touch a view this session was not started for.
        let live = reconciler.session().resolver().current_identity();
        if live.as_deref() != Some(session.focus_key.as_str()) {
            break WatchdogStop::FocusChanged;
        }
        let outcome = reconciler.reconcile().await;
        if outcome.identity() != Some(session.focus_key.as_str()) {
            break WatchdogStop::FocusChanged;
        }

        if outcome.did_work() {
            if session.stable_ticks > 0 {
                debug!(identity = %session.focus_key, ticks = session.ticks, "Watchdog repaired view");
            }
            session.stable_ticks = 0;
        } else {
            session.stable_ticks += 1;
        }

        if session.stable_ticks >= config.stable_ticks
            && reconciler.data_cached(&session.focus_key)
        {
            break WatchdogStop::Stable;
        }
        if session.ticks >= config.max_ticks {
            break WatchdogStop::TickCeiling;
        }
    };

    info!(
        identity = %session.focus_key,
        ticks = session.ticks,
        stable_ticks = session.stable_ticks,
        reason = %reason,
        "Watchdog stopped"
    );
    WatchdogReport { session, reason }
}
