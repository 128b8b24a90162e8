//! Per-operation deadlines for blocking capability calls.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::time::Duration;

use crate::error::ProviderError;

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Runs `op` with an upper bound on how long the caller waits for it.
///
/// With `None` the call runs inline. Otherwise it runs on a helper thread; if
/// the deadline passes first the caller gets `ProviderError::Temporary` and the
/// helper's eventual result is discarded.
///
/// The helper is not interrupted. A timed-out call keeps running and may still
/// take effect at the provider, possibly after the caller has retried it. Only
/// put a deadline on writes whose repetition is harmless.
pub fn call_with_deadline<T, F>(deadline: Option<Duration>, op: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    let Some(deadline) = deadline else {
        return op();
    };

    let (tx, rx) = bounded(1);
    std::thread::Builder::new()
        .name("capability-call".to_string())
        .spawn(move || {
            // Receiver may be gone after a timeout
            let _ = tx.send(op());
        })
        .map_err(|e| ProviderError::Temporary(format!("failed to spawn call thread: {}", e)))?;

    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            Err(ProviderError::Temporary(DEADLINE_EXCEEDED.to_string()))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(ProviderError::Temporary("capability call panicked".to_string()))
        }
    }
}
