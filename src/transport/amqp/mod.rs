//! AMQP connection sharing
//!
//! - [`connection`] - Connector and connection seams (wire protocol lives behind them)
//! - [`holder`] - One physical connection and its logical units
//! - [`pool`] - Identity to holder assignment, bucketed by authentication scope

pub mod connection;
pub mod holder;
pub mod pool;

pub use connection::{amqp_endpoint, AmqpConnection, AmqpConnector};
pub use holder::{AmqpUnit, ConnectionHolder, IdlePolicy};
pub use pool::{identity_hash, AssignmentPolicy, ConnectionPool, PoolBucket, PoolRegistry};
