//! Message persistence over a [`BlockStore`].
//!
//! Each message is one entry, in arrival order. Delivery locks the entry so
//! concurrent consumers never receive the same message; acknowledgement
//! removes it and rollback unlocks it.

use std::sync::Arc;

use vireo_core::message::now_millis;
use vireo_core::{DestinationDescriptor, Message, MessageSelector, SynchronizationBarrier};

use crate::block::BlockStore;
use crate::error::{StorageError, StorageResult};
use crate::journal::JournalStats;

/// A message and the handle of the entry holding it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Entry handle
    pub handle: i32,
    /// Decoded message
    pub message: Message,
}

/// Durable queue of messages.
#[derive(Debug)]
pub struct MessageStore {
    store: BlockStore,
}

impl MessageStore {
    /// Open the store described by `descriptor`.
    ///
    /// # Errors
    /// See [`BlockStore::open`].
    pub fn open(descriptor: DestinationDescriptor) -> StorageResult<Self> {
        Ok(Self { store: BlockStore::open(descriptor)? })
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Underlying block store.
    #[must_use]
    pub const fn block_store(&self) -> &BlockStore {
        &self.store
    }

    /// Append `message`. Returns its handle.
    ///
    /// # Errors
    /// Returns [`StorageError::Codec`] if the message cannot be encoded, or
    /// any block store error.
    pub fn put(&self, message: &Message) -> StorageResult<i32> {
        let bytes = message.to_bytes()?;
        self.store.store(&bytes)
    }

    /// Decode the message at `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] or [`StorageError::Codec`].
    pub fn get(&self, handle: i32) -> StorageResult<Message> {
        Ok(Message::from_bytes(self.store.retrieve(handle)?)?)
    }

    /// Lock and return the oldest unlocked message accepted by `selector`.
    /// Expired messages met along the way are removed.
    ///
    /// Each candidate is locked before it is read, so the returned message
    /// is always the one held under the returned handle.
    ///
    /// # Errors
    /// Propagates block store and codec errors.
    pub fn lock_first_available(&self, selector: &dyn MessageSelector) -> StorageResult<Option<StoredMessage>> {
        let now = now_millis();
        for handle in self.store.handles()? {
            match self.store.lock(handle) {
                Ok(()) => {},
                Err(StorageError::AlreadyLocked { .. } | StorageError::InvalidHandle { .. }) => continue,
                Err(e) => return Err(e),
            }
            let message = match self.get(handle) {
                Ok(message) => message,
                Err(StorageError::InvalidHandle { .. }) => {
                    self.store.unlock(handle)?;
                    continue;
                },
                Err(e) => {
                    self.release(handle);
                    return Err(e);
                },
            };
            if message.is_expired(now) {
                self.discard_expired(handle, &message.id)?;
                continue;
            }
            if !selector.matches(&message) {
                self.store.unlock(handle)?;
                continue;
            }
            return Ok(Some(StoredMessage { handle, message }));
        }
        Ok(None)
    }

    /// Release a delivered message so it can be delivered again.
    ///
    /// # Errors
    /// Returns [`StorageError::NotLocked`] if it was not delivered.
    pub fn unlock(&self, handle: i32) -> StorageResult<()> {
        self.store.unlock(handle)
    }

    /// Remove the message at `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if it does not exist.
    pub fn remove(&self, handle: i32) -> StorageResult<()> {
        self.store.delete(handle).map(|_| ())
    }

    /// Every unexpired message accepted by `selector`, locked or not, oldest
    /// first.
    ///
    /// # Errors
    /// Propagates block store and codec errors.
    pub fn browse(&self, selector: &dyn MessageSelector) -> StorageResult<Vec<StoredMessage>> {
        let now = now_millis();
        let mut out = Vec::new();
        for handle in self.store.handles()? {
            let message = match self.get(handle) {
                Ok(message) => message,
                Err(StorageError::InvalidHandle { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !message.is_expired(now) && selector.matches(&message) {
                out.push(StoredMessage { handle, message });
            }
        }
        Ok(out)
    }

    /// Number of stored messages, delivered ones included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.store.size()
    }

    /// Make every change durable and wait for it.
    ///
    /// # Errors
    /// See [`BlockStore::commit_changes`].
    pub fn commit(&self) -> StorageResult<()> {
        self.store.commit_changes()
    }

    /// Join `barrier` to the next durability point without waiting.
    ///
    /// # Errors
    /// See [`BlockStore::commit_changes_with`].
    pub fn commit_with(&self, barrier: &Arc<SynchronizationBarrier>) -> StorageResult<()> {
        self.store.commit_changes_with(barrier)
    }

    /// Whether producers should slow down.
    #[must_use]
    pub fn needs_throttling(&self) -> bool {
        self.store.needs_throttling()
    }

    /// Journal statistics, `None` without journaling.
    #[must_use]
    pub fn journal_stats(&self) -> Option<JournalStats> {
        self.store.journal_stats()
    }

    /// Commit and close.
    ///
    /// # Errors
    /// See [`BlockStore::close`].
    pub fn close(&self) -> StorageResult<()> {
        self.store.close()
    }

    fn release(&self, handle: i32) {
        if let Err(e) = self.store.unlock(handle) {
            tracing::warn!(store = %self.name(), handle, error = %e, "Cannot release message lock");
        }
    }

    /// Remove an expired message whose lock the caller holds.
    fn discard_expired(&self, handle: i32, id: &str) -> StorageResult<()> {
        match self.store.delete(handle) {
            Ok(_) => {
                tracing::debug!(store = %self.name(), message = id, "Dropped expired message");
                Ok(())
            },
            Err(StorageError::InvalidHandle { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vireo_core::{AcceptAll, DestinationRef, MessageBuilder, PropertyEquals, PropertyValue};

    fn open(dir: &TempDir) -> MessageStore {
        let mut descriptor = DestinationDescriptor::new("orders", dir.path());
        descriptor.block_size = 64;
        descriptor.initial_block_count = 8;
        MessageStore::open(descriptor).unwrap()
    }

    fn message(body: &'static [u8]) -> Message {
        MessageBuilder::new(DestinationRef::queue("orders")).with_body(body).build()
    }

    #[test]
    fn test_lock_first_available_skips_locked() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let a = store.put(&message(b"a")).unwrap();
        let b = store.put(&message(b"b")).unwrap();

        let first = store.lock_first_available(&AcceptAll).unwrap().unwrap();
        assert_eq!(first.handle, a);
        let second = store.lock_first_available(&AcceptAll).unwrap().unwrap();
        assert_eq!(second.handle, b);
        assert!(store.lock_first_available(&AcceptAll).unwrap().is_none());

        store.unlock(a).unwrap();
        assert_eq!(store.lock_first_available(&AcceptAll).unwrap().unwrap().handle, a);
        store.remove(a).unwrap();
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_selector_and_expiry() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let expired = MessageBuilder::new(DestinationRef::queue("orders")).with_expiration(1).build();
        store.put(&expired).unwrap();
        let tagged = MessageBuilder::new(DestinationRef::queue("orders"))
            .with_property("region", PropertyValue::String("eu".into()))
            .build();
        let tagged_handle = store.put(&tagged).unwrap();
        store.put(&message(b"untagged")).unwrap();

        let selector = PropertyEquals::new("region", PropertyValue::String("eu".into()));
        let found = store.lock_first_available(&selector).unwrap().unwrap();
        assert_eq!(found.handle, tagged_handle);
        assert_eq!(found.message, tagged);
        assert_eq!(store.size(), 2, "expired message is dropped during the scan");
        assert_eq!(store.browse(&AcceptAll).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_consumers_receive_the_locked_message() {
        const PRODUCED: usize = 200;
        let dir = TempDir::new().unwrap();
        let mut descriptor = DestinationDescriptor::new("orders", dir.path());
        descriptor.block_size = 64;
        descriptor.initial_block_count = 8;
        descriptor.auto_extend_amount = 16;
        descriptor.use_journal = false;
        let store = MessageStore::open(descriptor).unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);

        let delivered: Vec<Vec<String>> = std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..PRODUCED {
                    let body = format!("message {i}").into_bytes();
                    store.put(&MessageBuilder::new(DestinationRef::queue("orders")).with_body(body).build()).unwrap();
                }
                done.store(true, std::sync::atomic::Ordering::Release);
            });
            let consumers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut ids = Vec::new();
                        loop {
                            let finished = done.load(std::sync::atomic::Ordering::Acquire);
                            match store.lock_first_available(&AcceptAll).unwrap() {
                                Some(stored) => {
                                    assert_eq!(store.get(stored.handle).unwrap(), stored.message);
                                    store.remove(stored.handle).unwrap();
                                    ids.push(stored.message.id);
                                },
                                None if finished => break,
                                None => std::thread::yield_now(),
                            }
                        }
                        ids
                    })
                })
                .collect();
            consumers.into_iter().map(|c| c.join().unwrap()).collect()
        });

        let mut ids: Vec<String> = delivered.into_iter().flatten().collect();
        assert_eq!(ids.len(), PRODUCED);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), PRODUCED, "no message is delivered twice");
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let original = message(b"durable body");
        {
            let store = open(&dir);
            store.put(&original).unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }
        let store = open(&dir);
        let browsed = store.browse(&AcceptAll).unwrap();
        assert_eq!(browsed.len(), 1);
        assert_eq!(browsed[0].message, original);
    }
}
