//! Generic ccTalk command dispatcher
//!
//! Thin typed layer over [`MasterDevice::exec_command`]: each call sends a
//! header plus optional payload and decodes the reply data. No retries.

use super::DeviceError;
use crate::core::protocol::{Command, Message, ReplyHeader};
use crate::core::transport::{MasterDevice, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Number of (code, data) pairs in a buffered event reply
pub const EVENT_BUFFER_PAIRS: usize = 5;

/// Minimum reply length of "read buffered bill events"
const EVENT_BUFFER_LEN: usize = 1 + 2 * EVENT_BUFFER_PAIRS;

/// ccTalk comms revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommsRevision {
    /// Release number
    pub release: u8,
    /// Major revision
    pub major: u8,
    /// Minor revision
    pub minor: u8,
}

impl std::fmt::Display for CommsRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.release, self.major, self.minor)
    }
}

/// Country scaling factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScalingFactor {
    /// Low byte of the factor
    pub lsb: u8,
    /// High byte of the factor
    pub msb: u8,
    /// Number of decimal places
    pub decimals: u8,
}

impl ScalingFactor {
    /// 16-bit factor
    pub fn factor(&self) -> u16 {
        u16::from_le_bytes([self.lsb, self.msb])
    }
}

/// Reply of "read buffered bill events"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventBuffer {
    /// Event counter of the newest entry
    pub counter: u8,
    /// `(code, data)` pairs, newest first
    pub entries: [(u8, u8); EVENT_BUFFER_PAIRS],
}

/// Addressed slave on a shared bus
#[derive(Debug, Clone)]
pub struct SlaveDevice {
    address: u8,
    master: Arc<MasterDevice>,
    timeout: Duration,
}

impl SlaveDevice {
    /// Create a slave; prefer [`MasterDevice::add_slave`]
    pub fn new(address: u8, master: Arc<MasterDevice>) -> Self {
        Self {
            address,
            master,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Slave address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Bus master
    pub fn master(&self) -> &Arc<MasterDevice> {
        &self.master
    }

    /// Per-command timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send any header and return the raw reply
    pub async fn exec(&self, header: u8, data: &[u8]) -> Result<Message, DeviceError> {
        Ok(self
            .master
            .exec_command(self.address, header, data, self.timeout)
            .await?)
    }

    async fn exec_command(&self, command: Command, data: &[u8]) -> Result<Message, DeviceError> {
        tracing::trace!("{} -> {}", command.name(), self.address);
        self.exec(command.code(), data).await
    }

    async fn exec_ascii(&self, command: Command, data: &[u8]) -> Result<String, DeviceError> {
        let reply = self.exec_command(command, data).await?;
        Ok(String::from_utf8_lossy(reply.data()).into_owned())
    }

    /// Simple poll; true when the slave acknowledges
    pub async fn simple_poll(&self) -> Result<bool, DeviceError> {
        let reply = self.exec_command(Command::SimplePoll, &[]).await?;
        Ok(ReplyHeader::from_u8(reply.header) == Some(ReplyHeader::Ack))
    }

    /// Soft reset
    pub async fn reset_device(&self) -> Result<(), DeviceError> {
        self.exec_command(Command::ResetDevice, &[]).await?;
        Ok(())
    }

    /// ccTalk revision implemented by the slave
    pub async fn request_comms_revision(&self) -> Result<CommsRevision, DeviceError> {
        let reply = self.exec_command(Command::RequestCommsRevision, &[]).await?;
        match *reply.data() {
            [release, major, minor, ..] => Ok(CommsRevision {
                release,
                major,
                minor,
            }),
            _ => Err(incomplete(Command::RequestCommsRevision, 3, &reply)),
        }
    }

    /// Raw serial number bytes
    pub async fn request_serial_number(&self) -> Result<Vec<u8>, DeviceError> {
        let reply = self.exec_command(Command::RequestSerialNumber, &[]).await?;
        Ok(reply.into_data())
    }

    /// Software revision string
    pub async fn request_software_revision(&self) -> Result<String, DeviceError> {
        self.exec_ascii(Command::RequestSoftwareRevision, &[]).await
    }

    /// Build code string
    pub async fn request_build_code(&self) -> Result<String, DeviceError> {
        self.exec_ascii(Command::RequestBuildCode, &[]).await
    }

    /// Product code string
    pub async fn request_product_code(&self) -> Result<String, DeviceError> {
        self.exec_ascii(Command::RequestProductCode, &[]).await
    }

    /// Equipment category, e.g. "Bill Validator"
    pub async fn request_equipment_category_id(&self) -> Result<String, DeviceError> {
        self.exec_ascii(Command::RequestEquipmentCategoryId, &[]).await
    }

    /// Manufacturer id string
    pub async fn request_manufacturer_id(&self) -> Result<String, DeviceError> {
        self.exec_ascii(Command::RequestManufacturerId, &[]).await
    }

    /// Event counter plus the five most recent events
    pub async fn read_buffered_bill_events(&self) -> Result<EventBuffer, DeviceError> {
        let reply = self.exec_command(Command::ReadBufferedBillEvents, &[]).await?;
        let data = reply.data();
        if data.len() < EVENT_BUFFER_LEN {
            return Err(incomplete(Command::ReadBufferedBillEvents, EVENT_BUFFER_LEN, &reply));
        }
        let mut buffer = EventBuffer {
            counter: data[0],
            ..EventBuffer::default()
        };
        for (i, entry) in buffer.entries.iter_mut().enumerate() {
            *entry = (data[2 * i + 1], data[2 * i + 2]);
        }
        Ok(buffer)
    }

    /// Option flags byte (0 when the slave sends nothing)
    pub async fn request_option_flags(&self) -> Result<u8, DeviceError> {
        let reply = self.exec_command(Command::RequestOptionFlags, &[]).await?;
        Ok(reply.data().first().copied().unwrap_or(0))
    }

    /// Scaling factor for a two-letter country code
    pub async fn request_country_scaling_factor(&self, country: &str) -> Result<ScalingFactor, DeviceError> {
        if country.len() > 2 {
            return Err(DeviceError::InvalidArgument(format!(
                "country code '{country}' is longer than 2 characters"
            )));
        }
        let reply = self
            .exec_command(Command::RequestCountryScalingFactor, country.as_bytes())
            .await?;
        let byte = |i: usize| reply.data().get(i).copied().unwrap_or(0);
        Ok(ScalingFactor {
            lsb: byte(0),
            msb: byte(1),
            decimals: byte(2),
        })
    }

    /// Raw ROM checksum bytes
    pub async fn calculate_rom_checksum(&self) -> Result<Vec<u8>, DeviceError> {
        let reply = self.exec_command(Command::CalculateRomChecksum, &[]).await?;
        Ok(reply.into_data())
    }

    /// Currency revision, optionally for one country
    pub async fn request_currency_revision(&self, country: Option<&str>) -> Result<String, DeviceError> {
        let payload = country.unwrap_or_default().as_bytes();
        self.exec_ascii(Command::RequestCurrencyRevision, payload).await
    }

    /// Bill id string of one bill type
    pub async fn request_bill_id(&self, bill_type: u8) -> Result<String, DeviceError> {
        self.exec_ascii(Command::RequestBillId, &[bill_type]).await
    }

    /// Program the bill id string of one bill type
    pub async fn modify_bill_id(&self, bill_type: u8, value: &str) -> Result<(), DeviceError> {
        let mut payload = Vec::with_capacity(1 + value.len());
        payload.push(bill_type);
        payload.extend_from_slice(value.as_bytes());
        self.exec_command(Command::ModifyBillId, &payload).await?;
        Ok(())
    }

    /// Write the bill operating mode mask
    pub async fn modify_bill_operating_mode(&self, mask: u8) -> Result<(), DeviceError> {
        self.exec_command(Command::ModifyBillOperatingMode, &[mask]).await?;
        Ok(())
    }

    /// Read the bill operating mode mask
    pub async fn request_bill_operating_mode(&self) -> Result<u8, DeviceError> {
        let reply = self.exec_command(Command::RequestBillOperatingMode, &[]).await?;
        reply
            .data()
            .first()
            .copied()
            .ok_or_else(|| incomplete(Command::RequestBillOperatingMode, 1, &reply))
    }

    /// Write per-type inhibit bytes
    pub async fn modify_inhibit_status(&self, masks: &[u8]) -> Result<(), DeviceError> {
        self.exec_command(Command::ModifyInhibitStatus, masks).await?;
        Ok(())
    }

    /// Read per-type inhibit bytes
    pub async fn request_inhibit_status(&self) -> Result<Vec<u8>, DeviceError> {
        let reply = self.exec_command(Command::RequestInhibitStatus, &[]).await?;
        Ok(reply.into_data())
    }

    /// Master inhibit: `true` lets the slave accept, `false` inhibits everything
    pub async fn modify_master_inhibit_status(&self, accept: bool) -> Result<(), DeviceError> {
        self.exec_command(Command::ModifyMasterInhibitStatus, &[u8::from(accept)])
            .await?;
        Ok(())
    }
}

fn incomplete(command: Command, expected: usize, reply: &Message) -> DeviceError {
    DeviceError::IncompleteMessage {
        command: command.name(),
        expected,
        received: reply.data().len(),
    }
}
