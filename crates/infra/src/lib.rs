//! Infrastructure layer: persistence, outbox delivery, external ports and the
//! services that tie the pure domain crates to them.
//!
//! Every mutating service call runs inside one [`store::UnitOfWork`]; the
//! state change and its outbox rows commit or roll back together. Calls to
//! the payment gateway happen outside any unit of work and carry a timeout.

pub mod broker;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod outbox;
pub mod services;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod integration_tests;

pub use config::{Config, ConfigError};
pub use error::CheckoutError;
