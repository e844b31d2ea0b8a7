//! Outbound adapters: wire formats and `EventPublisher` implementations.

pub mod bus_publisher;
pub mod events;
pub mod rabbit_publisher;

pub use bus_publisher::BusEventPublisher;
pub use rabbit_publisher::RabbitEventPublisher;
