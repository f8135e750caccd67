//! # Vireo Broker
//!
//! Packet transports and the broker engine of the Vireo message broker.
//!
//! This crate provides:
//! - Blocking and multiplexed packet transports with keep-alive
//! - A client side hub correlating requests and responses
//! - A TCP server serving clients from durable destinations
//! - Sessions with transactions, acknowledgement and browsing
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use vireo_broker::{Broker, Connector, PacketServer};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = vireo_core::config::load_from_file("broker.toml")?;
//! let broker = Arc::new(Broker::open(&config)?);
//! let server = PacketServer::bind(&config.network, &config.transport, Arc::clone(&broker))?;
//!
//! let connection = Connector::new(config.transport.clone()).connect(server.local_address())?;
//! assert_eq!(connection.protocol_version(), vireo_core::protocol::PROTOCOL_VERSION);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod broker;
pub mod client;
pub mod error;
pub mod hub;
pub mod network;
pub mod processor;
pub mod session;

pub use broker::{Broker, BrokerStats};
pub use client::{ClientConnection, Connector};
pub use error::{BrokerError, BrokerResult, TransportError, TransportResult};
pub use hub::{TransportEndpoint, TransportHub};
pub use network::{
    BlockingTransport, MultiplexedTransport, Multiplexer, PacketServer, PacketTransport, PacketTransportListener,
    ServerMode, TransportId, TransportState,
};
pub use processor::ClientProcessor;
pub use session::Session;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        Broker, BrokerError, ClientConnection, Connector, PacketServer, PacketTransport, TransportEndpoint,
        TransportError, TransportHub,
    };
    pub use vireo_core::prelude::*;
}
