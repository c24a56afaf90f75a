//! The boundary between protocol logic and the platform BLE stack.
//!
//! Codecs never touch the radio. They queue [`TransportCommand`]s, the
//! driver hands each one to a [`Transport`] and feeds the resulting
//! [`TransportEvent`]s back one at a time.

use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::types::ConnectionStatus;

/// Expand a 16-bit SIG-assigned number into a full Bluetooth base UUID
#[must_use]
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

/// Pseudo characteristic carrying manufacturer advertisement data.
///
/// Payloads on it start with the little-endian company id followed by the
/// manufacturer-specific bytes.
pub const MANUFACTURER_DATA: Uuid = Uuid::from_u128(0x5CA1_E000_0000_4000_8000_0000_0000_0001);

/// One transport operation requested by a codec
#[derive(Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Enable notifications on a characteristic
    SubscribeNotify {
        /// Owning service
        service: Uuid,
        /// Characteristic to subscribe to
        characteristic: Uuid,
    },
    /// Enable indications on a characteristic
    SubscribeIndicate {
        /// Owning service
        service: Uuid,
        /// Characteristic to subscribe to
        characteristic: Uuid,
    },
    /// Write a value
    Write {
        /// Owning service
        service: Uuid,
        /// Target characteristic
        characteristic: Uuid,
        /// Bytes to write
        data: Vec<u8>,
        /// Whether the write needs a link-layer acknowledgement
        with_response: bool,
    },
    /// Read a value; the result arrives as [`TransportEvent::Value`]
    Read {
        /// Owning service
        service: Uuid,
        /// Characteristic to read
        characteristic: Uuid,
    },
    /// Tear the link down
    Disconnect,
}

impl TransportCommand {
    /// Written payload, if this is a write
    #[must_use]
    pub fn written_data(&self) -> Option<&[u8]> {
        match self {
            Self::Write { data, .. } => Some(data),
            _ => None,
        }
    }
}

impl fmt::Debug for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscribeNotify { characteristic, .. } => {
                write!(f, "SubscribeNotify({characteristic})")
            }
            Self::SubscribeIndicate { characteristic, .. } => {
                write!(f, "SubscribeIndicate({characteristic})")
            }
            Self::Write {
                characteristic,
                data,
                with_response,
                ..
            } => write!(
                f,
                "Write({characteristic}, {}{data:02X?})",
                if *with_response { "" } else { "no-response " }
            ),
            Self::Read { characteristic, .. } => write!(f, "Read({characteristic})"),
            Self::Disconnect => f.write_str("Disconnect"),
        }
    }
}

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Notification or indication
    Notify {
        /// Originating characteristic
        characteristic: Uuid,
        /// Raw value
        data: Vec<u8>,
    },
    /// Result of a [`TransportCommand::Read`]
    Value {
        /// Characteristic that was read
        characteristic: Uuid,
        /// Raw value
        data: Vec<u8>,
    },
    /// Link state change
    Status(ConnectionStatus),
}

/// Platform BLE primitives consumed by the driver
#[async_trait]
pub trait Transport: Send {
    /// Open the link to the device
    async fn connect(&mut self) -> Result<()>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<()>;

    /// Write a characteristic value
    async fn write_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications
    async fn subscribe_notify(&mut self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Enable indications
    async fn subscribe_indicate(&mut self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic value
    async fn read_characteristic(&mut self, service: Uuid, characteristic: Uuid)
        -> Result<Vec<u8>>;

    /// Run one queued command.
    ///
    /// Reads return their value so the driver can feed it back as an event.
    async fn execute(&mut self, command: &TransportCommand) -> Result<Option<TransportEvent>> {
        match command {
            TransportCommand::SubscribeNotify {
                service,
                characteristic,
            } => self.subscribe_notify(*service, *characteristic).await?,
            TransportCommand::SubscribeIndicate {
                service,
                characteristic,
            } => self.subscribe_indicate(*service, *characteristic).await?,
            TransportCommand::Write {
                service,
                characteristic,
                data,
                with_response,
            } => {
                self.write_characteristic(*service, *characteristic, data, *with_response)
                    .await?;
            }
            TransportCommand::Read {
                service,
                characteristic,
            } => {
                let data = self.read_characteristic(*service, *characteristic).await?;
                return Ok(Some(TransportEvent::Value {
                    characteristic: *characteristic,
                    data,
                }));
            }
            TransportCommand::Disconnect => self.disconnect().await?,
        }
        Ok(None)
    }
}
