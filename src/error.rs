use thiserror::Error;

/// Errors that can occur while polling Mi Flora sensors and publishing their readings
#[derive(Error, Debug)]
pub enum MifloraError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Scanning for or connecting to a peripheral failed
    #[error("Failed to connect to peripheral: {0}")]
    Connect(String),

    /// Service or characteristic discovery failed
    #[error("Failed to discover profile: {0}")]
    Profile(String),

    /// Reading or decoding a characteristic failed
    #[error("Failed to read characteristic: {0}")]
    Read(String),

    /// Writing a characteristic failed
    #[error("Failed to write characteristic: {0}")]
    Write(String),

    /// A radio operation did not complete in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid configuration detected at start-up
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Handing a line to the broker failed
    #[error("Failed to publish: {0}")]
    Publish(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for miflorad operations
pub type Result<T> = std::result::Result<T, MifloraError>;

impl MifloraError {
    /// Check if this error was raised by a single radio attempt and may succeed on retry
    #[must_use]
    pub const fn is_radio_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Connect(_)
                | Self::Profile(_)
                | Self::Read(_)
                | Self::Write(_)
                | Self::Timeout { .. }
        )
    }

    /// Check if this error must terminate the process
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
