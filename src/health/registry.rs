//! Service serving-status registry with per-subscriber fan-out.
//!
//! # Responsibilities
//! - Hold the serving status of every named service
//! - Derive the overall server status (empty name)
//! - Push status changes to every Watch subscriber independently
//!
//! # Design Decisions
//! - One unbounded queue per subscriber: a slow reader never blocks
//!   `set_status`, and never delays other subscribers
//! - The map lock is never held across an await
//! - Duplicate statuses are filtered at the source, not per subscriber
//! - A dropped watch releases its queue at once; placeholder entries for
//!   names nobody registered live only while someone watches them

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Health of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

impl ServingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingStatus::Unknown => "UNKNOWN",
            ServingStatus::Serving => "SERVING",
            ServingStatus::NotServing => "NOT_SERVING",
        }
    }
}

impl std::fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the overall server in Check/Watch.
pub const OVERALL: &str = "";

#[derive(Debug)]
struct Entry {
    status: ServingStatus,
    subscribers: Vec<mpsc::UnboundedSender<ServingStatus>>,
}

impl Entry {
    fn new(status: ServingStatus) -> Self {
        Self {
            status,
            subscribers: Vec::new(),
        }
    }

    /// Store `status` and notify subscribers if it changed.
    fn transition(&mut self, status: ServingStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        // Subscribers whose receiver is gone are dropped here.
        self.subscribers.retain(|tx| tx.send(status).is_ok());
        true
    }
}

#[derive(Debug)]
struct State {
    /// Registered services plus placeholders created by early watchers.
    services: HashMap<String, Entry>,
    /// Services explicitly given a status.
    registered: HashSet<String>,
    overall: Entry,
    overall_override: Option<ServingStatus>,
    shut_down: bool,
}

impl State {
    fn aggregate(&self) -> ServingStatus {
        if let Some(status) = self.overall_override {
            return status;
        }
        let degraded = self.registered.iter().any(|name| {
            self.services
                .get(name)
                .map(|entry| entry.status == ServingStatus::NotServing)
                .unwrap_or(false)
        });
        if degraded {
            ServingStatus::NotServing
        } else {
            ServingStatus::Serving
        }
    }

    fn status_of(&self, service: &str) -> ServingStatus {
        if service == OVERALL {
            return self.overall.status;
        }
        self.services
            .get(service)
            .map(|entry| entry.status)
            .unwrap_or(ServingStatus::Unknown)
    }

    /// Drop closed queues of `service`, and its entry once it is an unwatched placeholder.
    fn release(&mut self, service: &str) {
        if service == OVERALL {
            self.overall.subscribers.retain(|tx| !tx.is_closed());
            return;
        }
        let unused = match self.services.get_mut(service) {
            Some(entry) => {
                entry.subscribers.retain(|tx| !tx.is_closed());
                entry.subscribers.is_empty() && !self.registered.contains(service)
            }
            None => false,
        };
        if unused {
            self.services.remove(service);
        }
    }

    fn refresh_overall(&mut self) {
        let status = self.aggregate();
        if self.overall.transition(status) {
            tracing::debug!(status = %status, "Overall health changed");
        }
    }
}

/// Shared health state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<Mutex<State>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                services: HashMap::new(),
                registered: HashSet::new(),
                overall: Entry::new(ServingStatus::Serving),
                overall_override: None,
                shut_down: false,
            })),
        }
    }

    /// Set a service's status. The empty name overrides the overall status.
    ///
    /// Ignored after `shutdown`.
    pub fn set_status(&self, service: &str, status: ServingStatus) {
        let mut state = self.state.lock();
        if state.shut_down {
            tracing::debug!(service = %service, status = %status, "Health update after shutdown ignored");
            return;
        }

        if service == OVERALL {
            state.overall_override = Some(status);
        } else {
            state.registered.insert(service.to_string());
            let entry = state
                .services
                .entry(service.to_string())
                .or_insert_with(|| Entry::new(ServingStatus::Unknown));
            if entry.transition(status) {
                tracing::info!(service = %service, status = %status, "Health status changed");
                crate::observability::metrics::record_health_status(service, status);
            }
        }
        state.refresh_overall();
    }

    /// Drop the overall override and go back to the derived status.
    pub fn clear_overall_override(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.overall_override = None;
        state.refresh_overall();
    }

    /// Forget a service. Its watchers see `UNKNOWN`.
    pub fn remove(&self, service: &str) {
        let mut state = self.state.lock();
        if state.shut_down || service == OVERALL {
            return;
        }
        state.registered.remove(service);
        let unwatched = match state.services.get_mut(service) {
            Some(entry) => {
                if entry.transition(ServingStatus::Unknown) {
                    tracing::info!(service = %service, "Health status removed");
                }
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if unwatched {
            state.services.remove(service);
        }
        state.refresh_overall();
    }

    /// Point-in-time status. Unknown names report `UNKNOWN`.
    pub fn check(&self, service: &str) -> ServingStatus {
        self.state.lock().status_of(service)
    }

    /// Subscribe to a service. The current status is the first item.
    ///
    /// After `shutdown` the stream yields the final status and ends.
    pub fn watch(&self, service: &str) -> HealthWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = HealthWatch {
            rx,
            registry: Arc::downgrade(&self.state),
            service: service.to_string(),
        };
        let mut state = self.state.lock();

        if state.shut_down {
            // Receiver is alive; this cannot fail. The sender drops here, ending the stream.
            let _ = tx.send(state.status_of(service));
            return watch;
        }

        let entry = if service == OVERALL {
            &mut state.overall
        } else {
            state
                .services
                .entry(service.to_string())
                .or_insert_with(|| Entry::new(ServingStatus::Unknown))
        };
        entry.subscribers.retain(|tx| !tx.is_closed());
        let _ = tx.send(entry.status);
        entry.subscribers.push(tx);
        drop(state);

        watch
    }

    /// Mark everything `NOT_SERVING` and end all subscriptions.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.overall_override = Some(ServingStatus::NotServing);
        let registered: Vec<String> = state.registered.iter().cloned().collect();
        for name in registered {
            if let Some(entry) = state.services.get_mut(&name) {
                entry.transition(ServingStatus::NotServing);
            }
        }
        state.refresh_overall();
        state.shut_down = true;

        // Dropping the senders ends every watch stream.
        for entry in state.services.values_mut() {
            entry.subscribers.clear();
        }
        state.overall.subscribers.clear();
        tracing::info!("Health registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().registered.iter().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Number of live subscribers for a service.
    pub fn subscriber_count(&self, service: &str) -> usize {
        let mut state = self.state.lock();
        let entry = if service == OVERALL {
            Some(&mut state.overall)
        } else {
            state.services.get_mut(service)
        };
        match entry {
            Some(entry) => {
                entry.subscribers.retain(|tx| !tx.is_closed());
                entry.subscribers.len()
            }
            None => 0,
        }
    }

    /// Entries currently held: registered services plus watched placeholders.
    pub fn tracked_services(&self) -> usize {
        self.state.lock().services.len()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Status sequence for one subscriber.
///
/// Dropping it unsubscribes immediately.
#[derive(Debug)]
pub struct HealthWatch {
    rx: mpsc::UnboundedReceiver<ServingStatus>,
    registry: Weak<Mutex<State>>,
    service: String,
}

impl HealthWatch {
    pub async fn next_status(&mut self) -> Option<ServingStatus> {
        self.rx.recv().await
    }
}

impl Drop for HealthWatch {
    fn drop(&mut self) {
        // Closing first makes this subscriber's sender report closed.
        self.rx.close();
        if let Some(state) = self.registry.upgrade() {
            state.lock().release(&self.service);
        }
    }
}

impl Stream for HealthWatch {
    type Item = ServingStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn next(watch: &mut HealthWatch) -> Option<ServingStatus> {
        tokio::time::timeout(Duration::from_millis(200), watch.next())
            .await
            .expect("watch should yield")
    }

    fn assert_quiet(watch: &mut HealthWatch) {
        assert!(watch.rx.try_recv().is_err(), "unexpected extra emission");
    }

    #[test]
    fn unknown_services_report_unknown() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.check("nope"), ServingStatus::Unknown);
        assert_eq!(registry.check(OVERALL), ServingStatus::Serving);
    }

    #[tokio::test]
    async fn watch_emits_current_then_changes_only() {
        let registry = HealthRegistry::new();
        registry.set_status("svc", ServingStatus::Serving);

        let mut watch = registry.watch("svc");
        assert_eq!(next(&mut watch).await, Some(ServingStatus::Serving));

        registry.set_status("svc", ServingStatus::Serving);
        assert_quiet(&mut watch);

        registry.set_status("svc", ServingStatus::NotServing);
        assert_eq!(next(&mut watch).await, Some(ServingStatus::NotServing));
        assert_quiet(&mut watch);
    }

    #[tokio::test]
    async fn subscribers_fan_out_independently() {
        let registry = HealthRegistry::new();
        let mut slow = registry.watch("svc");
        let mut fast = registry.watch("svc");

        registry.set_status("svc", ServingStatus::Serving);
        registry.set_status("svc", ServingStatus::NotServing);

        for watch in [&mut fast, &mut slow] {
            assert_eq!(next(watch).await, Some(ServingStatus::Unknown));
            assert_eq!(next(watch).await, Some(ServingStatus::Serving));
            assert_eq!(next(watch).await, Some(ServingStatus::NotServing));
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let registry = HealthRegistry::new();
        let gone = registry.watch("svc");
        let mut kept = registry.watch("svc");
        drop(gone);

        registry.set_status("svc", ServingStatus::Serving);
        assert_eq!(next(&mut kept).await, Some(ServingStatus::Unknown));
        assert_eq!(next(&mut kept).await, Some(ServingStatus::Serving));
        assert_eq!(registry.subscriber_count("svc"), 1);
    }

    #[tokio::test]
    async fn overall_status_is_derived() {
        let registry = HealthRegistry::new();
        let mut overall = registry.watch(OVERALL);
        assert_eq!(next(&mut overall).await, Some(ServingStatus::Serving));

        registry.set_status("a", ServingStatus::Serving);
        registry.set_status("b", ServingStatus::Serving);
        assert_quiet(&mut overall);

        registry.set_status("b", ServingStatus::NotServing);
        assert_eq!(registry.check(OVERALL), ServingStatus::NotServing);
        assert_eq!(next(&mut overall).await, Some(ServingStatus::NotServing));

        registry.remove("b");
        assert_eq!(registry.check("b"), ServingStatus::Unknown);
        assert_eq!(next(&mut overall).await, Some(ServingStatus::Serving));

        registry.set_status(OVERALL, ServingStatus::NotServing);
        assert_eq!(next(&mut overall).await, Some(ServingStatus::NotServing));
        registry.clear_overall_override();
        assert_eq!(next(&mut overall).await, Some(ServingStatus::Serving));
    }

    #[tokio::test]
    async fn cancelled_watches_release_their_entries() {
        let registry = HealthRegistry::new();
        registry.set_status("svc", ServingStatus::Serving);

        for i in 0..1000 {
            drop(registry.watch("svc"));
            drop(registry.watch(&format!("random-{}", i)));
            drop(registry.watch(OVERALL));
        }

        assert_eq!(registry.state.lock().services["svc"].subscribers.len(), 0);
        assert!(registry.state.lock().overall.subscribers.is_empty());
        assert_eq!(registry.tracked_services(), 1);
        assert_eq!(registry.check("svc"), ServingStatus::Serving);
    }

    #[tokio::test]
    async fn placeholders_live_while_watched() {
        let registry = HealthRegistry::new();
        let mut early = registry.watch("later");
        let other = registry.watch("later");
        assert_eq!(registry.tracked_services(), 1);

        drop(other);
        assert_eq!(registry.tracked_services(), 1);
        assert_eq!(registry.subscriber_count("later"), 1);

        registry.set_status("later", ServingStatus::Serving);
        assert_eq!(next(&mut early).await, Some(ServingStatus::Unknown));
        assert_eq!(next(&mut early).await, Some(ServingStatus::Serving));

        // Removed while watched: the entry goes with its last watcher.
        registry.remove("later");
        assert_eq!(next(&mut early).await, Some(ServingStatus::Unknown));
        assert_eq!(registry.tracked_services(), 1);
        drop(early);
        assert_eq!(registry.tracked_services(), 0);
    }

    #[tokio::test]
    async fn watches_after_shutdown_leave_no_entries() {
        let registry = HealthRegistry::new();
        registry.shutdown();
        for i in 0..10 {
            let mut watch = registry.watch(&format!("late-{}", i));
            assert_eq!(next(&mut watch).await, Some(ServingStatus::Unknown));
            assert_eq!(next(&mut watch).await, None);
        }
        assert_eq!(registry.tracked_services(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_watches() {
        let registry = HealthRegistry::new();
        registry.set_status("svc", ServingStatus::Serving);
        let mut watch = registry.watch("svc");
        assert_eq!(next(&mut watch).await, Some(ServingStatus::Serving));

        registry.shutdown();
        assert_eq!(next(&mut watch).await, Some(ServingStatus::NotServing));
        assert_eq!(next(&mut watch).await, None);

        registry.set_status("svc", ServingStatus::Serving);
        assert_eq!(registry.check("svc"), ServingStatus::NotServing);
        assert_eq!(registry.check(OVERALL), ServingStatus::NotServing);

        let mut late = registry.watch("svc");
        assert_eq!(next(&mut late).await, Some(ServingStatus::NotServing));
        assert_eq!(next(&mut late).await, None);
    }
}
