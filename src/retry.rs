use crate::{
    ble::BleTransport,
    device::PeripheralReader,
    error::{MifloraError, Result},
    types::{DataMetric, Peripheral},
};
use tracing::{debug, warn};

/// How often a peripheral is tried within one sweep
///
/// Attempts follow each other immediately. The peripheral's own radio is the
/// bottleneck, so waiting between attempts only shortens the next sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per sweep, at least one
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy with `max_attempts` attempts, raised to one if zero
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Single attempt, no retry
    #[must_use]
    pub const fn no_retry() -> Self {
        Self { max_attempts: 1 }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Runs a [`PeripheralReader`] until it succeeds or the policy is exhausted
pub struct RetryController<'a, T: BleTransport> {
    reader: PeripheralReader<'a, T>,
    policy: RetryPolicy,
}

impl<'a, T: BleTransport> RetryController<'a, T> {
    /// Create a controller around `reader`
    #[must_use]
    pub const fn new(reader: PeripheralReader<'a, T>, policy: RetryPolicy) -> Self {
        Self { reader, policy }
    }

    /// Read `peripheral`, retrying failed attempts
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt once all attempts have failed.
    pub async fn read(&self, peripheral: &mut Peripheral) -> Result<DataMetric> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<MifloraError> = None;

        for attempt in 1..=max_attempts {
            match self.reader.read(peripheral).await {
                Ok(metric) => return Ok(metric),
                Err(e) => {
                    if attempt < max_attempts {
                        warn!(
                            "Reading {} failed on attempt {}/{}, retrying: {}",
                            peripheral.id, attempt, max_attempts, e
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        debug!(
            "Reading {} failed after {} attempts",
            peripheral.id, max_attempts
        );

        Err(last_error.unwrap_or_else(|| {
            MifloraError::Connect(format!("{} was never attempted", peripheral.id))
        }))
    }
}
