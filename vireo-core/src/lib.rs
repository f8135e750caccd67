//! # Vireo Core
//!
//! Foundation shared by the Vireo storage engine and broker.
//!
//! ## Architecture
//!
//! - [`message`]: message model and its binary encoding
//! - [`protocol`]: packet types, serializer and length-prefixed framing
//! - [`config`]: destination descriptors, transport settings and loading
//! - [`error`]: error types and the stable error code taxonomy
//! - [`sync`]: counting semaphore and synchronization barrier
//! - [`snapshot`]: copy-on-write list with cheap snapshots
//! - [`watchdog`]: shared idle detector with an injectable clock
//! - [`selector`]: message selection predicates
//! - [`telemetry`]: logging bootstrap
//!
//! ## Quick Start
//!
//! ```rust
//! use vireo_core::{DestinationRef, MessageBuilder};
//! use vireo_core::protocol::{Packet, PacketSerializer};
//! use vireo_core::protocol::queries::PutQuery;
//!
//! let message = MessageBuilder::new(DestinationRef::queue("orders"))
//!     .with_body(&b"hello"[..])
//!     .build();
//! let packet = Packet::new(PutQuery { session_id: 1, message });
//! let bytes = PacketSerializer::to_bytes(&packet).unwrap();
//! assert_eq!(PacketSerializer::unserialize(bytes).unwrap(), packet);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod message;
pub mod prelude;
pub mod protocol;
pub mod selector;
pub mod snapshot;
pub mod sync;
pub mod telemetry;
pub mod watchdog;

pub use crate::{
    config::{BrokerConfig, DestinationDescriptor, StorageSyncMethod, TransportSettings},
    error::{Error, ErrorCode, Result},
    message::{DeliveryMode, DestinationKind, DestinationRef, Message, MessageBuilder, PropertyValue},
    selector::{AcceptAll, IndexKey, MessageSelector, PropertyEquals},
    snapshot::SnapshotList,
    sync::{Semaphore, SynchronizationBarrier},
    watchdog::{ActiveObject, ActivityWatchdog, Clock, ManualClock, SystemClock, WatchId},
};
