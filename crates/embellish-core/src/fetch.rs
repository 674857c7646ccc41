//! Deduplicated, cache-backed data retrieval.
//!
//! [`FetchOrchestrator::resolve`] answers from the [`TtlCache`] when it can.
//! Otherwise it either joins the in-flight [`FetchTask`] for the key or
//! becomes that task's owner and calls the producer. At most one producer
//! call per key is in flight at any time.
//!
//! | Producer result      | Callers observe     | Cached            |
//! |----------------------|---------------------|-------------------|
//! | `Ok(Some(payload))`  | `Found(payload)`    | yes               |
//! | `Ok(None)`           | `NoData`            | yes, as `null`    |
//! | `Err(_)` / timeout   | `Unknown`           | no                |

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::error::{Error, Result};

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Value),
    /// The provider answered but has nothing for this key.
    NoData,
    /// The provider failed; nothing is known.
    Unknown,
}

impl Lookup {
    fn from_payload(payload: Value) -> Self {
        if payload.is_null() {
            Self::NoData
        } else {
            Self::Found(payload)
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Found(value) => Some(value),
            Self::NoData | Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Registry slot for a pending producer call.
///
/// The completion channel holds `None` while pending. Subscribers observe
/// `Unknown` if the owner goes away before settling.
#[derive(Debug)]
pub struct FetchTask {
    done: watch::Receiver<Option<Lookup>>,
}

enum Slot {
    Owner(watch::Sender<Option<Lookup>>),
    Subscriber(watch::Receiver<Option<Lookup>>),
}

/// Releases the registry slot however the owning future ends.
struct TaskGuard<'a> {
    tasks: &'a Mutex<HashMap<String, FetchTask>>,
    key: &'a str,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.key);
    }
}

#[derive(Debug)]
pub struct FetchOrchestrator {
    cache: Arc<TtlCache>,
    timeout: Duration,
    tasks: Mutex<HashMap<String, FetchTask>>,
}

impl FetchOrchestrator {
    #[must_use]
    pub fn new(cache: Arc<TtlCache>, timeout: Duration) -> Self {
        Self {
            cache,
            timeout,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// Number of producer calls currently pending.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Keys with a pending producer call.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = tasks
            .iter()
            .filter(|(_, task)| task.done.borrow().is_none())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Resolve `key`, calling `producer` only when neither the cache nor an
    /// in-flight task can answer.
    pub async fn resolve<F, Fut>(&self, key: &str, producer: F) -> Lookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        if let Some(payload) = self.cache.get(key) {
            debug!(key, "Cache hit");
            return Lookup::from_payload(payload);
        }

        let slot = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(task) = tasks.get(key) {
                Slot::Subscriber(task.done.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                tasks.insert(key.to_string(), FetchTask { done: rx });
                Slot::Owner(tx)
            }
        };

        match slot {
            Slot::Subscriber(mut rx) => {
                debug!(key, "Joining in-flight fetch");
                match rx.wait_for(Option::is_some).await {
                    Ok(settled) => settled.clone().unwrap_or(Lookup::Unknown),
                    Err(_) => Lookup::Unknown,
                }
            }
            Slot::Owner(tx) => {
                let _guard = TaskGuard {
                    tasks: &self.tasks,
                    key,
                };
                let lookup = self.produce(key, producer).await;
                tx.send_replace(Some(lookup.clone()));
                lookup
            }
        }
    }

    async fn produce<F, Fut>(&self, key: &str, producer: F) -> Lookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        let result = match tokio::time::timeout(self.timeout, producer()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(
                u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match result {
            Ok(Some(payload)) if !payload.is_null() => {
                self.cache.set(key, &payload);
                Lookup::Found(payload)
            }
            Ok(_) => {
                debug!(key, "Provider has no data");
                self.cache.set(key, &Value::Null);
                Lookup::NoData
            }
            Err(err) => {
                warn!(key, error = %err, "Fetch failed; result not cached");
                Lookup::Unknown
            }
        }
    }
}
