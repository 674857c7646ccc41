//! Bounded retry for "not ready yet" reconciles.
//!
//! The host populates views lazily, so the first reconcile after a trigger
//! often finds the focus view half-built. [`RetryScheduler`] re-runs the
//! reconciler with a linear backoff until it succeeds, the focus goes away,
//! or the attempt budget runs out.
//!
//! # State machine
//!
//! ```text
//!            trigger
//!   Idle ───────────────► Scheduled ──(delay)──► Running
//!                             ▲                    │
//!                             └──── NotReady ──────┤
//!                                                  ├── Succeeded ──► watchdog
//!                                                  ├── NoOp ───────► Idle
//!                                                  └── budget spent ► Exhausted
//! ```
//!
//! A fresh trigger aborts a pending delay and starts over at attempt 0. A
//! cycle caught mid-reconcile is not aborted; it is superseded and stops
//! after its current attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::host::LifecycleEvent;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::session::Session;
use crate::watchdog::Watchdog;

/// Linear backoff: `min(base + attempt * increment, max)`, optionally
/// jittered.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt.
    pub max_attempts: u32,
    /// Random jitter range as a fraction (0.1 = ±10%).
    pub jitter_percent: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            increment: Duration::from_millis(config.increment_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter_percent: config.jitter_percent.clamp(0.0, 1.0),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let step_ms = u64::try_from(self.increment.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let linear_ms = base_ms
            .saturating_add(step_ms.saturating_mul(u64::from(attempt)))
            .min(max_ms);

        if self.jitter_percent <= 0.0 {
            return Duration::from_millis(linear_ms);
        }

        let mut rng = rand::rng();
        let jitter_range = linear_ms as f64 * self.jitter_percent;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        let jittered_ms = (linear_ms as f64 + jitter).max(0.0) as u64;
        Duration::from_millis(jittered_ms.min(max_ms))
    }
}

/// Progress of one retry cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySession {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_delay: Option<Duration>,
}

impl RetrySession {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            last_delay: None,
        }
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    Scheduled { attempt: u32, delay: Duration },
    Running { attempt: u32 },
    Succeeded,
    Exhausted,
}

/// What caused a reconcile cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Initial,
    Mutation,
    Navigation,
    Lifecycle(LifecycleEvent),
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Mutation => write!(f, "mutation"),
            Self::Navigation => write!(f, "navigation"),
            Self::Lifecycle(event) => write!(f, "lifecycle:{event:?}"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

struct SchedulerState {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    reconciler: Arc<Reconciler>,
    watchdog: Watchdog,
    policy: BackoffPolicy,
    state: Mutex<SchedulerState>,
    /// Written only while `state` is locked.
    phase: watch::Sender<RetryPhase>,
    attempts: AtomicU64,
}

impl SchedulerInner {
    fn is_current(&self, generation: u64) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation
            == generation
    }

    /// Set the phase unless a newer cycle has taken over.
    fn set_phase(&self, generation: u64, phase: RetryPhase) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation != generation {
            return false;
        }
        self.phase.send_replace(phase);
        true
    }
}

#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("policy", &self.inner.policy)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>, watchdog: Watchdog, policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                reconciler,
                watchdog,
                policy,
                state: Mutex::new(SchedulerState {
                    generation: 0,
                    handle: None,
                }),
                phase: watch::Sender::new(RetryPhase::Idle),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn phase(&self) -> RetryPhase {
        *self.inner.phase.borrow()
    }

    /// Reconcile attempts made over the scheduler's lifetime.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    fn session(&self) -> &Arc<Session> {
        self.inner.reconciler.session()
    }

    /// Start a fresh cycle at attempt 0, superseding any earlier one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger(&self, source: TriggerSource) {
        self.session().clear_failures();

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        let generation = state.generation;

        if let Some(previous) = state.handle.take() {
            if matches!(self.phase(), RetryPhase::Scheduled { .. }) {
                previous.abort();
            }
        }

        debug!(source = %source, generation, "Reconcile triggered");
        self.inner.phase.send_replace(RetryPhase::Scheduled {
            attempt: 0,
            delay: Duration::ZERO,
        });
        state.handle = Some(tokio::spawn(run_cycle(
            Arc::clone(&self.inner),
            generation,
        )));
    }

    /// Abort a pending delay and return to idle. A reconcile already running
    /// finishes its attempt but makes no further progress.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            if matches!(self.phase(), RetryPhase::Scheduled { .. }) {
                handle.abort();
            }
        }
        self.inner.phase.send_replace(RetryPhase::Idle);
    }

    /// Wait until the latest cycle reaches a terminal phase.
    pub async fn settle(&self) {
        let mut phase = self.inner.phase.subscribe();
        let _ = phase
            .wait_for(|p| {
                matches!(
                    p,
                    RetryPhase::Idle | RetryPhase::Succeeded | RetryPhase::Exhausted
                )
            })
            .await;
    }
}

async fn run_cycle(inner: Arc<SchedulerInner>, generation: u64) {
    let mut session = RetrySession::new(inner.policy.max_attempts);

    loop {
        if !inner.set_phase(
            generation,
            RetryPhase::Running {
                attempt: session.attempt,
            },
        ) {
            return;
        }
        inner.attempts.fetch_add(1, Ordering::SeqCst);

        let outcome = inner.reconciler.reconcile().await;
        if !inner.is_current(generation) {
            debug!(generation, "Superseded cycle stops");
            return;
        }

        match outcome {
            ReconcileOutcome::Succeeded { identity, attached } => {
                inner.set_phase(generation, RetryPhase::Succeeded);
                debug!(identity = %identity, attempt = session.attempt, attached, "Reconcile succeeded");
                if !inner.watchdog.is_watching(&identity) {
                    inner.watchdog.start(&identity);
                }
                return;
            }
            ReconcileOutcome::NoOp => {
                inner.set_phase(generation, RetryPhase::Idle);
                return;
            }
            ReconcileOutcome::NotReady { identity } => {
                if session.exhausted() {
                    inner.set_phase(generation, RetryPhase::Exhausted);
                    warn!(
                        identity = %identity,
                        attempts = session.attempt + 1,
                        "Focus view never became ready; giving up until next trigger"
                    );
                    return;
                }

                let delay = inner.policy.delay_for_attempt(session.attempt);
                session.last_delay = Some(delay);
                session.attempt += 1;
                if !inner.set_phase(
                    generation,
                    RetryPhase::Scheduled {
                        attempt: session.attempt,
                        delay,
                    },
                ) {
                    return;
                }
                debug!(
                    identity = %identity,
                    attempt = session.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Focus view not ready; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::{Anchor, Annotator, anchor_by_class};
    use crate::config::WatchdogConfig;
    use crate::error::Result;
    use crate::fetch::Lookup;
    use crate::host::{
        ElementSpec, InsertPosition, MemoryNavigator, MemoryTree, NodeId, RenderTree,
    };
    use crate::target::requires_regions;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    #[test]
    fn linear_delays_cap_at_max() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..16)
            .map(|a| u64::try_from(policy.delay_for_attempt(a).as_millis()).unwrap())
            .collect();
        assert_eq!(&delays[..4], &[200, 300, 400, 500]);
        assert_eq!(delays[13], 1500);
        assert_eq!(delays[15], 1500);
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = BackoffPolicy {
            jitter_percent: 0.2,
            ..BackoffPolicy::default()
        };
        for _ in 0..100 {
            let ms = policy.delay_for_attempt(0).as_millis();
            assert!((160..=240).contains(&ms), "{ms}");
        }
    }

    #[test]
    fn retry_session_exhausts() {
        let mut session = RetrySession::new(2);
        assert!(!session.exhausted());
        session.attempt = 2;
        assert!(session.exhausted());
    }

    struct Note;

    #[async_trait]
    impl Annotator for Note {
        fn name(&self) -> &str {
            "note"
        }
        async fn fetch(&self, _identity: &str) -> Result<Option<Value>> {
            Ok(Some(json!("n")))
        }
        fn anchor(&self, tree: &dyn RenderTree, root: NodeId) -> Option<Anchor> {
            anchor_by_class(tree, root, "linksSection", InsertPosition::Append)
        }
        fn build(&self, _identity: &str, _lookup: &Lookup) -> Option<ElementSpec> {
            Some(ElementSpec::new("span").class("note"))
        }
    }

    struct Fixture {
        tree: Arc<MemoryTree>,
        nav: Arc<MemoryNavigator>,
        view: NodeId,
        scheduler: RetryScheduler,
        watchdog: Watchdog,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let tree = Arc::new(MemoryTree::new());
        let view = tree
            .append(
                MemoryTree::ROOT,
                &ElementSpec::new("div").class("view-item-item"),
            )
            .unwrap();
        let nav = Arc::new(MemoryNavigator::new("/details?id=1"));
        let session = Session::builder(tree.clone(), nav.clone())
            .readiness(requires_regions(vec!["linksSection".to_string()]))
            .build()
            .unwrap();
        let reconciler = Arc::new(Reconciler::new(
            session,
            vec![Arc::new(Note) as Arc<dyn Annotator>],
        ));
        let watchdog = Watchdog::new(Arc::clone(&reconciler), WatchdogConfig::default());
        let policy = BackoffPolicy {
            max_attempts,
            ..BackoffPolicy::default()
        };
        let scheduler = RetryScheduler::new(reconciler, watchdog.clone(), policy);
        Fixture {
            tree,
            nav,
            view,
            scheduler,
            watchdog,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_attempts_k_plus_one_times() {
        let f = fixture(4);
        f.scheduler.trigger(TriggerSource::Initial);
        f.scheduler.settle().await;

        assert_eq!(f.scheduler.attempts(), 5);
        assert_eq!(f.scheduler.phase(), RetryPhase::Exhausted);
        assert_eq!(f.watchdog.watching(), None);

        // Nothing further happens until a fresh trigger.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.scheduler.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn late_region_succeeds_and_starts_watchdog() {
        let f = fixture(15);
        let started = tokio::time::Instant::now();
        f.scheduler.trigger(TriggerSource::Initial);

        // Attempts at 0, 200, 500; region appears at 600; attempt at 900 succeeds.
        tokio::time::sleep(Duration::from_millis(600)).await;
        f.tree
            .append(f.view, &ElementSpec::new("div").class("linksSection"))
            .unwrap();
        f.scheduler.settle().await;

        assert_eq!(started.elapsed(), Duration::from_millis(900));
        assert_eq!(f.scheduler.attempts(), 4);
        assert_eq!(f.scheduler.phase(), RetryPhase::Succeeded);
        assert!(f.watchdog.is_watching("1"));
        assert_eq!(f.tree.count(&|e| e.has_class("note")), 1);
        f.watchdog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_trigger_restarts_at_attempt_zero() {
        let f = fixture(3);
        f.scheduler.trigger(TriggerSource::Initial);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(f.scheduler.attempts(), 2);
        assert!(matches!(
            f.scheduler.phase(),
            RetryPhase::Scheduled { attempt: 2, .. }
        ));

        f.scheduler.trigger(TriggerSource::Mutation);
        f.scheduler.settle().await;

        // Two from the first cycle, then a full 3 + 1 from the second.
        assert_eq!(f.scheduler.attempts(), 6);
        assert_eq!(f.scheduler.phase(), RetryPhase::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn no_focus_goes_idle() {
        let f = fixture(3);
        f.nav.navigate("/home");
        f.scheduler.trigger(TriggerSource::Navigation);
        f.scheduler.settle().await;
        assert_eq!(f.scheduler.attempts(), 1);
        assert_eq!(f.scheduler.phase(), RetryPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_retry() {
        let f = fixture(10);
        f.scheduler.trigger(TriggerSource::Manual);
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.scheduler.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.scheduler.attempts(), 1);
        assert_eq!(f.scheduler.phase(), RetryPhase::Idle);
    }
}
