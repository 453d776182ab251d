//! Structured cancellation.
//!
//! This module provides:
//! - [`CancellationScope`]: a hierarchical trigger injecting `Canceled`
//!   faults into registered stages
//! - [`CallbackRegistration`]: arena-indexed trigger callback handles
//! - [`cancel_after`] / [`cancel_at`]: timeouts as scheduled triggers

mod scope;
mod timeout;

pub use scope::{CallbackRegistration, CancellationScope};
pub use timeout::{cancel_after, cancel_at};
