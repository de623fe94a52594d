pub mod client;
pub mod transport;
pub mod wire;

pub use client::{random_client_id, DeliveryClient, DeliveryError};
pub use transport::{BrokerTransport, TransportError, ZmqTransport};
