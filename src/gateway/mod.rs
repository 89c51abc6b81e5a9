pub mod client;
pub mod error;
pub mod events;
pub mod transport;

pub use client::BrokerClient;
pub use error::BrokerError;
pub use events::GatewayEvent;
pub use transport::RealtimeTransport;
