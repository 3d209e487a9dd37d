//! Reconnect backoff.
//!
//! The schedule lives in [`RetryPolicy`]; the gateway client owns the
//! timer that sleeps on it.

mod policy;

pub use policy::RetryPolicy;
