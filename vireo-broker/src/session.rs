//! Client sessions: transactions, deliveries and browsers.
//!
//! A transacted session buffers its puts and holds every delivered message
//! locked until `commit` removes them or `rollback` releases them. A
//! non-transacted session writes through; what happens to a delivery then
//! depends on the acknowledge mode.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, trace};
use vireo_core::protocol::queries::AcknowledgeMode;
use vireo_core::{AcceptAll, DestinationRef, Message};

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};

/// A message handed to the client and not yet consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delivery {
    destination: String,
    handle: i32,
    message_id: String,
}

/// Snapshot of a destination taken when the browser was created.
#[derive(Debug)]
struct Browser {
    destination: String,
    remaining: VecDeque<Message>,
}

/// State of one client session.
#[derive(Debug)]
pub struct Session {
    id: i32,
    transacted: bool,
    acknowledge_mode: AcknowledgeMode,
    pending_puts: Vec<Message>,
    delivered: Vec<Delivery>,
    browsers: HashMap<i32, Browser>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new(id: i32, transacted: bool, acknowledge_mode: AcknowledgeMode) -> Self {
        Self {
            id,
            transacted,
            acknowledge_mode,
            pending_puts: Vec::new(),
            delivered: Vec::new(),
            browsers: HashMap::new(),
        }
    }

    /// Session id chosen by the client.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Whether changes wait for `commit`.
    #[must_use]
    pub const fn is_transacted(&self) -> bool {
        self.transacted
    }

    /// Messages delivered and still locked by this session.
    #[must_use]
    pub fn unacknowledged(&self) -> usize {
        self.delivered.len()
    }

    /// Puts waiting for `commit`.
    #[must_use]
    pub fn pending_puts(&self) -> usize {
        self.pending_puts.len()
    }

    /// Store `message`, immediately or at commit time.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownDestination`] or a storage error.
    pub fn put(&mut self, broker: &Broker, message: Message) -> BrokerResult<()> {
        let store = broker.store(&message.destination)?;
        if self.transacted {
            self.pending_puts.push(message);
            return Ok(());
        }
        store.put(&message)?;
        broker.commit(&BTreeSet::from([message.destination.name]))
    }

    /// Deliver the oldest available message of `destination`, if any.
    ///
    /// Auto and dups-ok sessions consume the message right away. Transacted
    /// and client-acknowledge sessions keep it locked until it is committed,
    /// acknowledged or rolled back.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownDestination`] or a storage error.
    pub fn get(&mut self, broker: &Broker, destination: &DestinationRef) -> BrokerResult<Option<Message>> {
        let store = broker.store(destination)?;
        let Some(stored) = store.lock_first_available(&AcceptAll)? else {
            return Ok(None);
        };
        trace!(session = self.id, destination = %destination.name, handle = stored.handle, "Message delivered");
        if self.consumes_on_delivery() {
            store.remove(stored.handle)?;
            broker.commit(&BTreeSet::from([destination.name.clone()]))?;
        } else {
            self.delivered.push(Delivery {
                destination: destination.name.clone(),
                handle: stored.handle,
                message_id: stored.message.id.clone(),
            });
        }
        Ok(Some(stored.message))
    }

    const fn consumes_on_delivery(&self) -> bool {
        !self.transacted && !matches!(self.acknowledge_mode, AcknowledgeMode::Client)
    }

    /// Acknowledge delivered messages of `destination`.
    ///
    /// Only client-acknowledge sessions act on it; transacted sessions consume
    /// at commit and the other modes already consumed at delivery. Ids that
    /// were never delivered are ignored.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn acknowledge(&mut self, broker: &Broker, destination: &DestinationRef, message_ids: &[String]) -> BrokerResult<()> {
        if self.transacted || !matches!(self.acknowledge_mode, AcknowledgeMode::Client) {
            return Ok(());
        }
        let store = broker.store(destination)?;
        let (acked, kept): (Vec<Delivery>, Vec<Delivery>) = std::mem::take(&mut self.delivered)
            .into_iter()
            .partition(|d| d.destination == destination.name && message_ids.contains(&d.message_id));
        self.delivered = kept;
        if acked.is_empty() {
            return Ok(());
        }
        for delivery in &acked {
            store.remove(delivery.handle)?;
        }
        debug!(session = self.id, destination = %destination.name, count = acked.len(), "Messages acknowledged");
        broker.commit(&BTreeSet::from([destination.name.clone()]))
    }

    /// Store the buffered puts and consume the delivered messages, as one
    /// durable unit across every destination touched.
    ///
    /// # Errors
    /// Returns [`BrokerError::InvalidState`] for a non-transacted session, or
    /// a storage error.
    pub fn commit(&mut self, broker: &Broker) -> BrokerResult<()> {
        if !self.transacted {
            return Err(BrokerError::invalid_state(format!("session {} is not transacted", self.id)));
        }
        let mut touched = BTreeSet::new();
        for message in self.pending_puts.drain(..) {
            broker.store(&message.destination)?.put(&message)?;
            touched.insert(message.destination.name);
        }
        for delivery in self.delivered.drain(..) {
            broker.store_named(&delivery.destination)?.remove(delivery.handle)?;
            touched.insert(delivery.destination);
        }
        debug!(session = self.id, destinations = touched.len(), "Committing session");
        broker.commit(&touched)
    }

    /// Drop the buffered puts and make every delivered message available
    /// again.
    ///
    /// # Errors
    /// Returns the first unlock error; the remaining messages are still
    /// released.
    pub fn rollback(&mut self, broker: &Broker) -> BrokerResult<()> {
        self.pending_puts.clear();
        let mut first = None;
        for delivery in self.delivered.drain(..) {
            let released = broker
                .store_named(&delivery.destination)
                .and_then(|s| s.unlock(delivery.handle).map_err(BrokerError::from));
            if let Err(e) = released {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Release one delivered message so it can be delivered again.
    ///
    /// # Errors
    /// Returns a storage error. An unknown message is ignored.
    pub fn rollback_message(&mut self, broker: &Broker, destination: &DestinationRef, message_id: &str) -> BrokerResult<()> {
        let Some(position) =
            self.delivered.iter().position(|d| d.destination == destination.name && d.message_id == message_id)
        else {
            return Ok(());
        };
        let delivery = self.delivered.remove(position);
        broker.store(destination)?.unlock(delivery.handle)?;
        Ok(())
    }

    /// Open a browser over the current content of `destination`.
    ///
    /// # Errors
    /// Returns [`BrokerError::InvalidState`] if the id is taken, or
    /// [`BrokerError::UnknownDestination`].
    pub fn create_browser(&mut self, broker: &Broker, browser_id: i32, destination: &DestinationRef) -> BrokerResult<()> {
        if self.browsers.contains_key(&browser_id) {
            return Err(BrokerError::invalid_state(format!("browser {browser_id} already exists")));
        }
        let snapshot = broker.store(destination)?.browse(&AcceptAll)?;
        let remaining = snapshot.into_iter().map(|s| s.message).collect();
        self.browsers.insert(browser_id, Browser { destination: destination.name.clone(), remaining });
        Ok(())
    }

    /// Next message of a browser, `None` once exhausted.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownBrowser`].
    pub fn browser_fetch(&mut self, browser_id: i32) -> BrokerResult<Option<Message>> {
        let browser = self
            .browsers
            .get_mut(&browser_id)
            .ok_or(BrokerError::UnknownBrowser { session_id: self.id, browser_id })?;
        let next = browser.remaining.pop_front();
        if next.is_none() {
            trace!(session = self.id, browser = browser_id, destination = %browser.destination, "Browser exhausted");
        }
        Ok(next)
    }

    /// Forget a browser.
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownBrowser`].
    pub fn close_browser(&mut self, browser_id: i32) -> BrokerResult<()> {
        self.browsers
            .remove(&browser_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownBrowser { session_id: self.id, browser_id })
    }

    /// Roll back whatever is still pending and drop the browsers.
    ///
    /// # Errors
    /// See [`Session::rollback`].
    pub fn close(&mut self, broker: &Broker) -> BrokerResult<()> {
        self.browsers.clear();
        self.rollback(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vireo_core::{DestinationDescriptor, MessageBuilder};

    fn broker(dir: &TempDir) -> Broker {
        let descriptors = ["orders", "audit"].map(|name| DestinationDescriptor {
            block_size: 64,
            initial_block_count: 16,
            ..DestinationDescriptor::new(name, dir.path().join(name))
        });
        Broker::with_destinations(descriptors).unwrap()
    }

    fn message(destination: &str, body: &'static str) -> Message {
        MessageBuilder::new(DestinationRef::queue(destination)).with_body(body).build()
    }

    fn body(message: &Message) -> &[u8] {
        message.body.as_deref().unwrap_or_default()
    }

    #[test]
    fn test_auto_ack_consumes_on_get() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let orders = DestinationRef::queue("orders");
        let mut session = Session::new(1, false, AcknowledgeMode::Auto);

        session.put(&broker, message("orders", "a")).unwrap();
        assert_eq!(broker.queue_size(&orders).unwrap(), 1);

        let got = session.get(&broker, &orders).unwrap().unwrap();
        assert_eq!(body(&got), b"a");
        assert_eq!(broker.queue_size(&orders).unwrap(), 0);
        assert!(session.get(&broker, &orders).unwrap().is_none());
    }

    #[test]
    fn test_transacted_put_visible_after_commit() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let orders = DestinationRef::queue("orders");
        let mut session = Session::new(1, true, AcknowledgeMode::Auto);

        session.put(&broker, message("orders", "a")).unwrap();
        session.put(&broker, message("audit", "b")).unwrap();
        assert_eq!(session.pending_puts(), 2);
        assert_eq!(broker.queue_size(&orders).unwrap(), 0);

        session.commit(&broker).unwrap();
        assert_eq!(broker.queue_size(&orders).unwrap(), 1);
        assert_eq!(broker.queue_size(&DestinationRef::queue("audit")).unwrap(), 1);
    }

    #[test]
    fn test_transacted_rollback_redelivers() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let orders = DestinationRef::queue("orders");
        let mut producer = Session::new(1, false, AcknowledgeMode::Auto);
        producer.put(&broker, message("orders", "a")).unwrap();

        let mut consumer = Session::new(2, true, AcknowledgeMode::Auto);
        let first = consumer.get(&broker, &orders).unwrap().unwrap();
        assert!(consumer.get(&broker, &orders).unwrap().is_none(), "locked message must not be delivered twice");

        consumer.rollback(&broker).unwrap();
        let again = consumer.get(&broker, &orders).unwrap().unwrap();
        assert_eq!(again.id, first.id);

        consumer.commit(&broker).unwrap();
        assert_eq!(broker.queue_size(&orders).unwrap(), 0);
    }

    #[test]
    fn test_client_ack_removes_only_acknowledged() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let orders = DestinationRef::queue("orders");
        let mut session = Session::new(1, false, AcknowledgeMode::Client);
        session.put(&broker, message("orders", "a")).unwrap();
        session.put(&broker, message("orders", "b")).unwrap();

        let a = session.get(&broker, &orders).unwrap().unwrap();
        let _b = session.get(&broker, &orders).unwrap().unwrap();
        assert_eq!(session.unacknowledged(), 2);

        session.acknowledge(&broker, &orders, &[a.id.clone(), "unknown".to_owned()]).unwrap();
        assert_eq!(session.unacknowledged(), 1);
        assert_eq!(broker.queue_size(&orders).unwrap(), 1);

        session.close(&broker).unwrap();
        let mut other = Session::new(2, false, AcknowledgeMode::Auto);
        assert_eq!(body(&other.get(&broker, &orders).unwrap().unwrap()), b"b");
    }

    #[test]
    fn test_rollback_single_message() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let orders = DestinationRef::queue("orders");
        let mut session = Session::new(1, true, AcknowledgeMode::Auto);
        let mut producer = Session::new(2, false, AcknowledgeMode::Auto);
        producer.put(&broker, message("orders", "a")).unwrap();

        let got = session.get(&broker, &orders).unwrap().unwrap();
        session.rollback_message(&broker, &orders, &got.id).unwrap();
        assert_eq!(session.unacknowledged(), 0);
        assert!(session.get(&broker, &orders).unwrap().is_some());
    }

    #[test]
    fn test_commit_requires_transaction() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let mut session = Session::new(7, false, AcknowledgeMode::Auto);
        assert!(matches!(session.commit(&broker), Err(BrokerError::InvalidState { .. })));
    }

    #[test]
    fn test_browser_sees_snapshot() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let orders = DestinationRef::queue("orders");
        let mut session = Session::new(1, false, AcknowledgeMode::Auto);
        session.put(&broker, message("orders", "a")).unwrap();
        session.put(&broker, message("orders", "b")).unwrap();

        session.create_browser(&broker, 5, &orders).unwrap();
        assert!(session.create_browser(&broker, 5, &orders).is_err());
        session.put(&broker, message("orders", "c")).unwrap();

        assert_eq!(body(&session.browser_fetch(5).unwrap().unwrap()), b"a");
        assert_eq!(body(&session.browser_fetch(5).unwrap().unwrap()), b"b");
        assert!(session.browser_fetch(5).unwrap().is_none());
        assert_eq!(broker.queue_size(&orders).unwrap(), 3, "browsing does not consume");

        session.close_browser(5).unwrap();
        assert!(matches!(session.browser_fetch(5), Err(BrokerError::UnknownBrowser { browser_id: 5, .. })));
    }

    #[test]
    fn test_unknown_destination() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let mut session = Session::new(1, false, AcknowledgeMode::Auto);
        let err = session.put(&broker, message("nowhere", "x")).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDestination { .. }));
    }
}
