//! Domain events and their outbox representation.
//!
//! Domain crates define typed event enums and implement [`Event`] for them.
//! Infrastructure turns a typed event into a [`NewOutboxEvent`] row inside the
//! same unit of work as the state change it describes; the publisher later
//! reads [`OutboxEvent`] rows back and forwards them to the broker.

pub mod event;
pub mod outbox;
pub mod topic;

pub use event::Event;
pub use outbox::{NewOutboxEvent, OutboxEncodeError, OutboxEvent};
pub use topic::Topic;
