//! Zero-downtime replacement of the routing table.
//!
//! # Responsibilities
//! - Build the replacement table completely before anyone can see it
//! - Publish it with one atomic swap, advancing the epoch
//! - Drive health transitions for services that appear, stay or disappear
//! - Track retired generations still pinned by in-flight calls
//!
//! # Design Decisions
//! - Resets are serialised by a mutex; calls are never blocked by it
//! - A failed build leaves the live table and health untouched
//! - Retired generations are held weakly, so tracking them never delays
//!   their release

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::schema::ResetHealthPolicy;
use crate::dispatch::{Dispatcher, ResetEpoch, RoutingError, RoutingGeneration, RoutingTableBuilder};
use crate::health::{HealthRegistry, ServingStatus};

/// A reset that was not applied.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResetError {
    #[error("replacement table rejected: {0}")]
    Build(#[from] RoutingError),
}

/// Serialises and applies resets.
#[derive(Clone)]
pub struct ResetController {
    dispatcher: Dispatcher,
    health: HealthRegistry,
    policy: ResetHealthPolicy,
    retired: Arc<Mutex<Vec<Weak<RoutingGeneration>>>>,
}

impl ResetController {
    /// Marks the services of the current table `SERVING`.
    pub fn new(dispatcher: Dispatcher, health: HealthRegistry, policy: ResetHealthPolicy) -> Self {
        for service in dispatcher.current().table().services() {
            health.set_status(service, ServingStatus::Serving);
        }
        Self {
            dispatcher,
            health,
            policy,
            retired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn policy(&self) -> ResetHealthPolicy {
        self.policy
    }

    pub fn epoch(&self) -> ResetEpoch {
        self.dispatcher.epoch()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Replace the live routing table.
    ///
    /// Calls resolved before the swap finish on the old table; calls
    /// resolved after it see only the new one.
    pub fn reset(&self, builder: RoutingTableBuilder) -> Result<ResetEpoch, ResetError> {
        // Holding the retired list serialises concurrent resets.
        let mut retired = self.retired.lock();

        let table = match builder.build() {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, epoch = %self.dispatcher.epoch(), "Reset rejected");
                crate::observability::metrics::record_reset(None);
                return Err(e.into());
            }
        };

        let previous = self.dispatcher.current();
        let old_services: HashSet<String> = previous.table().services().into_iter().map(String::from).collect();
        let new_services: Vec<String> = table.services().into_iter().map(String::from).collect();
        drop(previous);

        if self.policy == ResetHealthPolicy::TransientNotServing {
            for service in old_services.iter().filter(|s| new_services.contains(*s)) {
                self.health.set_status(service, ServingStatus::NotServing);
            }
        }

        let (epoch, old) = self.dispatcher.publish(table);

        for service in &new_services {
            self.health.set_status(service, ServingStatus::Serving);
        }
        for service in old_services.iter().filter(|s| !new_services.contains(*s)) {
            self.health.remove(service);
        }

        retired.retain(|generation| generation.strong_count() > 0);
        retired.push(Arc::downgrade(&old));
        drop(old);

        tracing::info!(
            epoch = %epoch,
            services = new_services.len(),
            policy = ?self.policy,
            "Routing table reset"
        );
        crate::observability::metrics::record_reset(Some(epoch.as_u64()));
        Ok(epoch)
    }

    /// Epochs of retired generations that in-flight calls still use.
    pub fn draining_generations(&self) -> Vec<ResetEpoch> {
        let mut retired = self.retired.lock();
        retired.retain(|generation| generation.strong_count() > 0);
        retired
            .iter()
            .filter_map(Weak::upgrade)
            .map(|generation| generation.epoch())
            .collect()
    }
}

impl std::fmt::Debug for ResetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetController")
            .field("epoch", &self.dispatcher.epoch())
            .field("policy", &self.policy)
            .finish()
    }
}
