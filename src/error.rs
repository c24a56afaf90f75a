use thiserror::Error;

/// Errors that can occur when talking to a body scale
#[derive(Error, Debug)]
pub enum ScaleError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Scale not found")]
    DeviceNotFound,

    /// No codec is registered for the discovered device
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid parameters supplied by the caller
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Packet has a bad magic byte, a wrong length or an unknown layout
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Packet trailer does not match the recomputed checksum
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch {
        /// Checksum computed over the packet
        expected: u8,
        /// Checksum carried by the packet
        actual: u8,
    },

    /// Well-formed packet that does not fit the current protocol step
    #[error("Unexpected packet {opcode:02X} at step {step}")]
    UnexpectedPacket {
        /// Command or response type byte of the packet
        opcode: u8,
        /// Step the session was waiting in
        step: usize,
    },

    /// Device reported an explicit error code
    #[error("Device error: status code {status:02X}")]
    DeviceError {
        /// Device status error code
        status: u8,
    },

    /// An encrypted command was requested before a session key exists
    #[error("No session key derived - encrypted command refused")]
    NotAuthenticated,

    /// Payload could not be decrypted into a valid frame
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Settings store could not be read or updated
    #[error("Settings error: {0}")]
    Settings(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for scale operations
pub type Result<T> = std::result::Result<T, ScaleError>;

impl ScaleError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::Disconnected | Self::DeviceNotFound
        )
    }

    /// Check if this error only concerns a single inbound packet.
    ///
    /// Packet errors are logged and the packet is dropped; the session keeps
    /// waiting in its current step.
    #[must_use]
    pub const fn is_packet_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedPacket(_)
                | Self::ChecksumMismatch { .. }
                | Self::UnexpectedPacket { .. }
                | Self::Cipher(_)
        )
    }

    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.is_packet_error()
            || matches!(
                self,
                Self::Timeout { .. } | Self::InvalidParameters(_) | Self::NotAuthenticated
            )
    }
}
