//! `orderflow-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the clock abstraction, currency, aggregate traits and the error
//! classification shared by every other crate.

pub mod aggregate;
pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, VersionMismatch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::Entity;
pub use error::{Classified, DEPENDENCY_MESSAGE, ErrorBody, ErrorClass, IdParseError};
pub use id::{CouponId, CourseId, OrderId, OrderItemId, PaymentId, RedemptionId, RefundId, UserId};
pub use value_object::{Currency, InvalidCurrency, ValueObject};
