//! stockflow-middleware: Partitioned log transport
//!
//! Provides the trait-based `Transport` / `Subscription` abstraction over an
//! ordered, partitioned, append-only log, with an in-memory implementation
//! for testing and a NATS JetStream implementation for production.

pub mod error;
pub mod factory;
pub mod memory;
pub mod nats;
pub mod transport;

pub use error::TransportError;
pub use factory::{create_transport, FactoryError, TransportKind, TransportSettings};
pub use memory::InMemoryTransport;
pub use nats::{NatsTransport, PartitionSubjects};
pub use transport::{
    Delivery, ProduceRecord, Subscription, Transport, TransportMessage, TransportOptions,
};
