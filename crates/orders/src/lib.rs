//! Order aggregate and its status state machine.

pub mod error;
pub mod item;
pub mod order;
pub mod status;

pub use error::OrderError;
pub use item::{ItemType, OrderItem};
pub use order::{
    CancelOrder, CreateOrder, Order, OrderCancelledByUser, OrderCommand, OrderCreated, OrderEvent,
    OrderParts, OrderPaymentStarted, OrderStatusChanged, StartPayment, TransitionOrder,
};
pub use status::{OrderState, OrderStatus};
