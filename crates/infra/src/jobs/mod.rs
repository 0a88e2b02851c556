//! Background jobs that run next to request handling.
//!
//! - [`expiry`]: cancels orders left unpaid past their expiry.
//!
//! The outbox publisher lives in [`crate::outbox::publisher`] and follows the
//! same shape: `run_once` for one pass, `spawn` for the timed loop, and a
//! handle with `shutdown().await` and `stats()`.

pub mod expiry;

pub use expiry::{ExpirySweeper, SweepReport, SweeperHandle, SweeperStats};
