/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - broker_session                                       |
/// |   - dtos                                                 |
/// |   - order_consumer                                       |
/// +----------------------------------------------------------+

/// Reconnecting RabbitMQ session around the order consumer.
pub mod broker_session;

/// Data transfer objects for order-arrival notifications.
pub mod dtos;

/// Consumer turning notifications into book inserts and wake-ups.
pub mod order_consumer;
