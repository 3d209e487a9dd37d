pub mod chat;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod pairing;
pub mod retry;

pub use error::{GatewayError, GatewayResult};
pub use gateway::{ConnectionState, GatewayClient};
pub use pairing::{PairingMachine, PairingState};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
