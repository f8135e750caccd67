//! Broker engine: the destinations and their message stores.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use vireo_core::config::ConfigValidator;
use vireo_core::{BrokerConfig, DestinationDescriptor, DestinationRef, SynchronizationBarrier};
use vireo_storage::MessageStore;

use crate::error::{BrokerError, BrokerResult};

/// Destinations hosted by one broker process.
#[derive(Debug)]
pub struct Broker {
    stores: HashMap<String, Arc<MessageStore>>,
    sessions: AtomicUsize,
    connections: AtomicUsize,
}

impl Broker {
    /// Validate `config` and open every destination it declares.
    ///
    /// # Errors
    /// Returns [`BrokerError::Core`] for an invalid configuration, or the
    /// storage error of the first destination that fails to open.
    pub fn open(config: &BrokerConfig) -> BrokerResult<Self> {
        ConfigValidator::validate(config)?;
        Self::with_destinations(config.destinations.iter().cloned())
    }

    /// Open the given destinations without a full configuration.
    ///
    /// # Errors
    /// Returns the storage error of the first destination that fails to open.
    /// Stores opened before it are closed again.
    pub fn with_destinations(descriptors: impl IntoIterator<Item = DestinationDescriptor>) -> BrokerResult<Self> {
        let mut stores = HashMap::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            match MessageStore::open(descriptor) {
                Ok(store) => {
                    info!(destination = %name, messages = store.size(), "Destination opened");
                    stores.insert(name, Arc::new(store));
                },
                Err(e) => {
                    for store in stores.values() {
                        let _ = store.close();
                    }
                    return Err(e.into());
                },
            }
        }
        Ok(Self { stores, sessions: AtomicUsize::new(0), connections: AtomicUsize::new(0) })
    }

    /// Store of `destination`.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownDestination`] if it is not hosted here.
    pub fn store(&self, destination: &DestinationRef) -> BrokerResult<&Arc<MessageStore>> {
        self.store_named(&destination.name)
    }

    /// Store of the destination called `name`.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownDestination`] if it is not hosted here.
    pub fn store_named(&self, name: &str) -> BrokerResult<&Arc<MessageStore>> {
        self.stores.get(name).ok_or_else(|| BrokerError::UnknownDestination { name: name.to_owned() })
    }

    /// Names of the hosted destinations, sorted.
    #[must_use]
    pub fn destinations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Commit the pending changes of the named stores as one unit and wait
    /// until all of them are durable.
    ///
    /// Every store joins the same barrier, so journaling stores sync in
    /// parallel and the caller is released once, after the slowest one.
    ///
    /// # Errors
    /// Returns the first commit error, or the barrier's failure.
    pub fn commit(&self, destinations: &BTreeSet<String>) -> BrokerResult<()> {
        if destinations.is_empty() {
            return Ok(());
        }
        let barrier = Arc::new(SynchronizationBarrier::new());
        for name in destinations {
            self.store_named(name)?.commit_with(&barrier)?;
        }
        barrier.wait()?;
        Ok(())
    }

    /// Messages stored in `destination`, delivered ones included.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownDestination`] if it is not hosted here.
    pub fn queue_size(&self, destination: &DestinationRef) -> BrokerResult<usize> {
        Ok(self.store(destination)?.size())
    }

    /// Whether any store is behind on its journal and producers should slow
    /// down.
    #[must_use]
    pub fn needs_throttling(&self) -> bool {
        self.stores.values().any(|s| s.needs_throttling())
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            destinations: self.stores.len(),
            stored_messages: self.stores.values().map(|s| s.size()).sum(),
            sessions: self.sessions.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    /// Close every store, flushing journals.
    ///
    /// # Errors
    /// Returns the first close error; the remaining stores are still closed.
    pub fn close(&self) -> BrokerResult<()> {
        let mut first = None;
        for (name, store) in &self.stores {
            if let Err(e) = store.close() {
                warn!(destination = %name, error = %e, "Failed to close destination");
                first.get_or_insert(e);
            }
        }
        info!(destinations = self.stores.len(), "Broker closed");
        first.map_or(Ok(()), |e| Err(e.into()))
    }
}

/// Broker runtime statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    /// Hosted destinations
    pub destinations: usize,
    /// Messages across all destinations
    pub stored_messages: usize,
    /// Open client sessions
    pub sessions: usize,
    /// Connected clients
    pub connections: usize,
}
