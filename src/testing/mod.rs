//! Testing utilities and mock implementations
//!
//! Mocks stand in for the broker channel, the AMQP connector and the
//! application's callbacks so every transport path can be tested offline.

pub mod mocks;

pub use mocks::*;
