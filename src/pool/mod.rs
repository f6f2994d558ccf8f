//! Object pools.
//!
//! * [`ValuePool`] hands out one shared instance per distinct value, so that
//!   frequently repeated immutable values are only kept in memory once.
//! * [`FixedPool`] keeps idle instances of objects which are expensive to
//!   construct, and optionally tops up or trims the idle set in the
//!   background.
//!
//! Neither pool wraps errors: failures of a [`Factory`] reach the caller that
//! triggered the construction unchanged.

mod fixed;
mod value;

pub use self::{
	fixed::{Factory, FixedPool, RebalanceConfig},
	value::{ValuePool, DEFAULT_RETENTION},
};
