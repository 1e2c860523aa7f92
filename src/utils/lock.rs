use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use super::error::{Error, Result};

/// Acquires `mutex` or gives up after `timeout`.
///
/// This is the only backpressure the components have: a caller that cannot
/// get the table lock in time gets `Error::Timeout` instead of queueing up
/// behind it forever.
pub fn lock_within<'a, T>(
    mutex: &'a Mutex<T>,
    timeout: Duration,
    resource: &'static str,
) -> Result<MutexGuard<'a, T>> {
    mutex.try_lock_for(timeout).ok_or_else(|| {
        warn!("Timed out after {:?} waiting for {} lock", timeout, resource);
        Error::Timeout {
            resource,
            waited_ms: timeout.as_millis() as u64,
        }
    })
}
