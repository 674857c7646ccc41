//! External change detection.
//!
//! [`MutationWatch`] turns host activity into debounced reconcile triggers:
//!
//! - tree mutation batches, minus the engine's own insertions, prunes and
//!   marker writes
//! - navigation address changes, found by polling
//! - host lifecycle signals, when the host exposes any
//!
//! Relevant activity arms a trailing debounce timer; each new event pushes
//! the deadline out, so a burst of host rendering produces one trigger.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::host::{Element, LifecycleEvent, LifecycleSource, Mutation, MutationBatch};
use crate::reconcile::{MARKER_PREFIX, is_owned};
use crate::retry::{RetryScheduler, TriggerSource};
use crate::session::Session;

/// Whether every change in `batch` was made by the engine itself.
///
/// Removals count as the engine's own only when the reconciler recorded the
/// node as pruned; a host removing one of our elements is not self-caused.
#[must_use]
pub fn is_self_caused(batch: &MutationBatch, session: &Session) -> bool {
    !batch.mutations.is_empty()
        && batch.mutations.iter().all(|m| match m {
            Mutation::ChildList { added, removed, .. } => {
                (!added.is_empty() || !removed.is_empty())
                    && added.iter().all(is_owned)
                    && removed
                        .iter()
                        .all(|e| is_owned(e) && session.was_pruned(e.id))
            }
            Mutation::Attribute { name, .. } => name.starts_with(MARKER_PREFIX),
        })
}

/// Decides which batches warrant a reconcile.
#[derive(Clone)]
pub struct RelevanceFilter {
    session: Arc<Session>,
    region_classes: Vec<String>,
}

impl RelevanceFilter {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        let region_classes = session.config().watch.region_classes.clone();
        Self {
            session,
            region_classes,
        }
    }

    fn is_structural(&self, element: &Element) -> bool {
        self.session.resolver().is_candidate(element)
            || self.region_classes.iter().any(|c| element.has_class(c))
    }

    fn subtree_is_structural(&self, element: &Element) -> bool {
        self.is_structural(element)
            || !self
                .session
                .tree()
                .find(Some(element.id), &|e| self.is_structural(e))
                .is_empty()
    }

    /// Whether `batch` touches a focus view, an expected region, or one of
    /// the engine's own elements.
    #[must_use]
    pub fn is_relevant(&self, batch: &MutationBatch) -> bool {
        let self_caused = is_self_caused(batch, &self.session);
        for mutation in &batch.mutations {
            if let Mutation::ChildList { removed, .. } = mutation {
                for element in removed {
                    self.session.forget_pruned(element.id);
                }
            }
        }
        if self_caused {
            return false;
        }
        batch.mutations.iter().any(|m| match m {
            Mutation::Attribute { target, name, .. } => {
                name == "class" && self.session.resolver().is_candidate(target)
            }
            Mutation::ChildList { added, removed, .. } => {
                added
                    .iter()
                    .any(|e| !is_owned(e) && self.subtree_is_structural(e))
                    || removed
                        .iter()
                        .any(|e| is_owned(e) || self.is_structural(e))
            }
        })
    }
}

pub struct MutationWatch {
    session: Arc<Session>,
    scheduler: RetryScheduler,
    filter: RelevanceFilter,
    batches: broadcast::Receiver<MutationBatch>,
    lifecycle: Option<broadcast::Receiver<LifecycleEvent>>,
}

impl std::fmt::Debug for MutationWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationWatch")
            .field("lifecycle", &self.lifecycle.is_some())
            .finish_non_exhaustive()
    }
}

async fn next_lifecycle(
    rx: &mut Option<broadcast::Receiver<LifecycleEvent>>,
) -> Result<LifecycleEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl MutationWatch {
    /// Subscribe to the host now; nothing published after construction is
    /// missed.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        scheduler: RetryScheduler,
        lifecycle: Option<&dyn LifecycleSource>,
    ) -> Self {
        let filter = RelevanceFilter::new(Arc::clone(&session));
        let batches = session.tree().subscribe();
        Self {
            session,
            scheduler,
            filter,
            batches,
            lifecycle: lifecycle.and_then(|l| l.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the tree's mutation channel closes.
    pub async fn run(self) {
        let Self {
            session,
            scheduler,
            filter,
            mut batches,
            mut lifecycle,
        } = self;
        let settings = &session.config().watch;
        let debounce = settings.debounce();
        let navigator = session.navigator();

        let poll_every = settings.nav_poll();
        let mut nav_poll = tokio::time::interval_at(Instant::now() + poll_every, poll_every);
        nav_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_address = navigator.current_address();

        let mut deadline: Option<Instant> = None;
        let mut pending_source = TriggerSource::Mutation;

        info!(lifecycle = lifecycle.is_some(), "Mutation watch started");

        loop {
            tokio::select! {
                batch = batches.recv() => match batch {
                    Ok(batch) => {
                        if filter.is_relevant(&batch) {
                            deadline = Some(Instant::now() + debounce);
                            pending_source = TriggerSource::Mutation;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mutation batches dropped; assuming relevant");
                        deadline = Some(Instant::now() + debounce);
                        pending_source = TriggerSource::Mutation;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = nav_poll.tick() => {
                    let address = navigator.current_address();
                    if address != last_address {
                        debug!(from = %last_address, to = %address, "Navigation detected");
                        last_address = address;
                        deadline = Some(Instant::now() + debounce);
                        pending_source = TriggerSource::Navigation;
                    }
                }
                event = next_lifecycle(&mut lifecycle) => match event {
                    Ok(event) => {
                        debug!(?event, "Host lifecycle signal");
                        deadline = Some(Instant::now() + debounce);
                        pending_source = TriggerSource::Lifecycle(event);
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => lifecycle = None,
                },
                () = debounce_elapsed(deadline) => {
                    deadline = None;
                    scheduler.trigger(pending_source);
                }
            }
        }

        info!("Mutation watch stopped");
    }
}
