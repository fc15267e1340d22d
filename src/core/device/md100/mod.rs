//! MD-100 bill acceptor/dispenser
//!
//! Composes the generic [`SlaveDevice`] dispatcher with the device's event
//! semantics ([`DeviceStateMachine`]), its bill type table and the macro
//! operations in [`operations`]. Device commands are named after what they
//! do on this device, never after the generic command they wrap.

mod operations;
mod polling;

use super::bill_types::{self, BillType, BillTypeTable, BILL_TYPE_COUNT};
use super::events::{snapshot_from_buffer, DeviceEvent, DeviceState};
use super::macros::MacroExecutor;
use super::slave::{CommsRevision, ScalingFactor, SlaveDevice};
use super::state_machine::{DeviceNotification, DeviceStateMachine, Property};
use super::DeviceError;
use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default pause between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default country for scaling factor and currency queries
pub const DEFAULT_COUNTRY: &str = "RU";

/// MD-100 specific command headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Md100Command {
    /// Fill size of every bill type
    RequestFillSize = 94,
    /// Set the device clock
    SetDateTime = 95,
    /// Pay out bills
    MasterDispense = 97,
}

/// Option flags and operating mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ModeControlMask(pub u8);

impl ModeControlMask {
    /// Stacker supported
    pub const STACKER: u8 = 1 << 0;
    /// Escrow supported
    pub const ESCROW: u8 = 1 << 1;
    /// Refill allowed in game mode
    pub const FILL_IN_GAME: u8 = 1 << 2;
    /// Ignore a full cashbox
    pub const IGNORE_CBOX_FULL: u8 = 1 << 3;
    /// Unload mode
    pub const UNLOAD: u8 = 1 << 4;
    /// Fill mode
    pub const FILL: u8 = 1 << 5;
    /// Bill reverse check active
    pub const BILL_REVERSE_CHECK: u8 = 1 << 6;

    /// Whether every bit of `flag` is set
    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }
}

/// Option flags reported by the device
pub type OptionFlags = ModeControlMask;

/// System operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Normal operation
    #[default]
    Game,
    /// Dispenser slots are emptied
    Unload,
    /// Dispenser slots are refilled
    Fill,
}

impl OperationMode {
    /// Bits written to the mode control mask
    pub fn bits(self) -> u8 {
        match self {
            Self::Game => 0,
            Self::Unload => ModeControlMask::UNLOAD,
            Self::Fill => ModeControlMask::FILL,
        }
    }

    /// Mode from a mode control mask; only the fill/unload bits count
    pub fn from_mask(mask: u8) -> Self {
        if mask & ModeControlMask::FILL != 0 {
            Self::Fill
        } else if mask & ModeControlMask::UNLOAD != 0 {
            Self::Unload
        } else {
            Self::Game
        }
    }
}

/// Dispenser slot addressed by a dispense
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispenseSlot {
    /// Test dispense, moves nothing
    Test,
    /// Slot 1
    Ss1,
    /// Slot 2
    Ss2,
    /// Slot 3
    Ss3,
}

impl DispenseSlot {
    /// Wire value; also the id of the bill type stored in the slot
    pub fn code(self) -> u8 {
        match self {
            Self::Test => 0x00,
            Self::Ss1 => 0x12,
            Self::Ss2 => 0x13,
            Self::Ss3 => 0x14,
        }
    }

    /// Slot from its wire value
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Test),
            0x12 => Some(Self::Ss1),
            0x13 => Some(Self::Ss2),
            0x14 => Some(Self::Ss3),
            _ => None,
        }
    }

    /// Slot from its 1-based number (`0` is the test slot)
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            0 => Some(Self::Test),
            1 => Some(Self::Ss1),
            2 => Some(Self::Ss2),
            3 => Some(Self::Ss3),
            _ => None,
        }
    }
}

/// Pay out strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayoutStrategy {
    /// Largest denomination first
    BiggestBillFirst = 0x00,
    /// Fullest slot first
    BiggestStockFirst = 0x10,
}

/// Pay mode of a dispense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Paymode {
    /// Nothing leaves the device
    Test = 0,
    /// Real pay out
    Real = 2,
}

/// Reply of a master dispense
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispenseResult {
    /// Payout code, 0 on success
    pub payout_code: u8,
    /// Count of a dispense still in process
    pub previous_count: Option<u8>,
    /// Slot of a dispense still in process
    pub previous_slot: Option<u8>,
}

impl DispenseResult {
    /// Whether the device accepted the dispense
    pub fn is_ok(&self) -> bool {
        self.payout_code == 0
    }

    /// Human readable payout code
    pub fn description(&self) -> &'static str {
        match self.payout_code {
            0x00 => "no errors",
            0xA5 => "pay out denied, validation fail (active encryption)",
            0xA6 => "pay out denied, old pay out in process",
            0xA7 => "false bill type or none filled",
            _ => "unknown error",
        }
    }
}

/// Firmware identification block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SoftwareRevision {
    /// Main firmware
    pub firmware: String,
    /// Acceptor encryption
    pub acceptor_encryption: String,
    /// Acceptor head
    pub acceptor_head: String,
    /// Dispenser
    pub dispenser: String,
}

impl SoftwareRevision {
    const PART_LEN: usize = 32;

    /// Split the 128-character revision string into its four parts
    pub fn parse(value: &str) -> Self {
        let chars: Vec<char> = value.chars().collect();
        let part = |i: usize| -> String {
            chars
                .iter()
                .skip(i * Self::PART_LEN)
                .take(Self::PART_LEN)
                .collect()
        };
        let dispenser = part(3)
            .chars()
            .map(|c| match c {
                '\u{0}'..='\u{9}' => format!("<{:02}>", c as u32),
                other => other.to_string(),
            })
            .collect();
        Self {
            firmware: part(0),
            acceptor_encryption: part(1),
            acceptor_head: part(2),
            dispenser,
        }
    }
}

impl fmt::Display for SoftwareRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {} / {}",
            self.firmware.trim(),
            self.acceptor_encryption.trim(),
            self.acceptor_head.trim(),
            self.dispenser.trim()
        )
    }
}

/// Cached identity and configuration of the device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceInfo {
    /// Equipment category id
    pub equipment_category: String,
    /// Product code
    pub product_code: String,
    /// Build code
    pub build_code: String,
    /// Manufacturer id
    pub manufacturer_id: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware identification
    pub software_revision: SoftwareRevision,
    /// ccTalk comms revision
    pub comms_revision: CommsRevision,
    /// Option flags
    pub option_flags: OptionFlags,
    /// ROM checksums
    pub checksums: Vec<String>,
    /// Country scaling factor
    pub scaling_factor: ScalingFactor,
    /// Currency revision
    pub currency_revision: String,
    /// Operating mode
    pub operation_mode: OperationMode,
}

/// Device options
#[derive(Debug, Clone)]
pub struct Md100Options {
    /// Country for the scaling factor and currency revision
    pub country: String,
    /// Pause between two polls
    pub poll_interval: Duration,
}

impl Default for Md100Options {
    fn default() -> Self {
        Self {
            country: DEFAULT_COUNTRY.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Serial number as printed on the device: bytes reversed, concatenated as decimals
pub fn format_serial_number(bytes: &[u8]) -> String {
    bytes.iter().rev().map(u8::to_string).collect()
}

/// ROM checksum bytes reversed and grouped into four 2-byte hex strings
pub fn format_checksums(bytes: &[u8]) -> Vec<String> {
    let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
    (0..4)
        .map(|i| {
            let byte = |j: usize| reversed.get(j).copied().unwrap_or(0);
            format!("{:02X}{:02X}", byte(2 * i), byte(2 * i + 1))
        })
        .collect()
}

/// Clock format expected by the device
const DATE_TIME_FORMAT: &str = "%d%m%y%H%M%S";

/// MD-100 device on a ccTalk bus
pub struct Md100 {
    slave: SlaveDevice,
    options: Md100Options,
    bill_types: Arc<RwLock<BillTypeTable>>,
    state: DeviceStateMachine,
    executor: MacroExecutor,
    info: RwLock<DeviceInfo>,
    polling: Mutex<Option<polling::PollingTask>>,
}

impl Md100 {
    /// Create a device on top of a registered slave
    pub fn new(slave: SlaveDevice, options: Md100Options) -> Arc<Self> {
        let bill_types = Arc::new(RwLock::new(BillTypeTable::new()));
        let shutdown = slave.master().shutdown_token();
        Arc::new(Self {
            slave,
            options,
            state: DeviceStateMachine::new(Arc::clone(&bill_types)),
            bill_types,
            executor: MacroExecutor::new(shutdown),
            info: RwLock::new(DeviceInfo::default()),
            polling: Mutex::new(None),
        })
    }

    /// Underlying dispatcher
    pub fn slave(&self) -> &SlaveDevice {
        &self.slave
    }

    /// Device options
    pub fn options(&self) -> &Md100Options {
        &self.options
    }

    /// Event log and readiness
    pub fn state_machine(&self) -> &DeviceStateMachine {
        &self.state
    }

    /// Current coarse state
    pub fn state(&self) -> DeviceState {
        self.state.state()
    }

    /// Whether the device accepts commands
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Subscribe to device notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceNotification> {
        self.state.subscribe()
    }

    /// Cached identity and configuration
    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    /// Copy of the bill type table
    pub fn bill_types(&self) -> BillTypeTable {
        self.bill_types.read().clone()
    }

    /// Whether any acceptor bill type is enabled
    pub fn is_accepting(&self) -> bool {
        self.bill_types.read().is_accepting()
    }

    /// Whether a macro operation is running
    pub fn is_operation_executing(&self) -> bool {
        self.executor.is_executing()
    }

    /// Cancel the running macro operation
    pub fn cancel_operation(&self) {
        self.executor.cancel();
    }

    /// Cancel any operation and stop polling
    pub async fn terminate(&self) {
        self.cancel_operation();
        self.stop_polling().await;
    }

    fn update_info(&self, property: Property, update: impl FnOnce(&mut DeviceInfo)) {
        update(&mut self.info.write());
        self.state.notify(DeviceNotification::PropertyUpdated { property });
    }

    fn bill_types_updated(&self) {
        self.state.notify(DeviceNotification::PropertyUpdated {
            property: Property::BillTypes,
        });
    }

    async fn exec(&self, command: Md100Command, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        tracing::trace!("{:?} -> {}", command, self.slave.address());
        let reply = self.slave.exec(command as u8, data).await?;
        Ok(reply.into_data())
    }

    fn require_ready(&self) -> Result<(), DeviceError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(DeviceError::NotReady)
        }
    }

    /// Read the event buffer as events, newest first
    pub async fn fetch_events(&self) -> Result<Vec<DeviceEvent>, DeviceError> {
        let buffer = self.slave.read_buffered_bill_events().await?;
        Ok(snapshot_from_buffer(&buffer))
    }

    /// Serial number string
    pub async fn read_serial_number(&self) -> Result<String, DeviceError> {
        let bytes = self.slave.request_serial_number().await?;
        Ok(format_serial_number(&bytes))
    }

    /// Firmware identification block
    pub async fn read_software_revision(&self) -> Result<SoftwareRevision, DeviceError> {
        let value = self.slave.request_software_revision().await?;
        Ok(SoftwareRevision::parse(&value))
    }

    /// Option flags
    pub async fn read_option_flags(&self) -> Result<OptionFlags, DeviceError> {
        Ok(ModeControlMask(self.slave.request_option_flags().await?))
    }

    /// ROM checksums as four hex strings
    pub async fn read_checksums(&self) -> Result<Vec<String>, DeviceError> {
        let bytes = self.slave.calculate_rom_checksum().await?;
        Ok(format_checksums(&bytes))
    }

    /// Set the device clock
    pub async fn set_date_time(&self, value: NaiveDateTime) -> Result<(), DeviceError> {
        let formatted = value.format(DATE_TIME_FORMAT).to_string();
        self.exec(Md100Command::SetDateTime, formatted.as_bytes()).await?;
        Ok(())
    }

    /// Read one bill type and store it in the table
    pub async fn request_bill_type(&self, id: u8) -> Result<BillType, DeviceError> {
        let value = self.slave.request_bill_id(id).await?;
        let bill = BillType::parse(id, &value);
        self.bill_types.write().set(bill.clone());
        self.bill_types_updated();
        Ok(bill)
    }

    /// Reprogram the bill type of a dispenser slot
    pub async fn write_bill_type(
        &self,
        slot: DispenseSlot,
        country: &str,
        value_code: &str,
        max_fill: u16,
    ) -> Result<(), DeviceError> {
        let value = bill_types::bill_id_string(country, value_code, max_fill)?;
        self.slave.modify_bill_id(slot.code(), &value).await
    }

    /// Read the inhibit mask and update every bill type's inhibit bit
    pub async fn read_inhibit_mask(&self) -> Result<u32, DeviceError> {
        let bytes = self.slave.request_inhibit_status().await?;
        if bytes.len() < 3 {
            return Err(DeviceError::IncompleteMessage {
                command: "RequestInhibitStatus",
                expected: 3,
                received: bytes.len(),
            });
        }
        let mask = bill_types::mask_from_bytes(&bytes);
        self.bill_types.write().set_mask(mask);
        self.bill_types_updated();
        Ok(mask)
    }

    /// Write the inhibit mask and update the table
    pub async fn apply_inhibit_mask(&self, mask: u32) -> Result<(), DeviceError> {
        self.slave
            .modify_inhibit_status(&bill_types::mask_to_bytes(mask))
            .await?;
        self.bill_types.write().set_mask(mask);
        self.bill_types_updated();
        Ok(())
    }

    /// Write raw mode control bits; the device must be ready
    pub async fn set_mode_control_mask(&self, mask: ModeControlMask) -> Result<(), DeviceError> {
        self.require_ready()?;
        self.slave.modify_bill_operating_mode(mask.0).await
    }

    /// Switch the operating mode; the device must be ready
    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), DeviceError> {
        self.set_mode_control_mask(ModeControlMask(mode.bits())).await
    }

    /// Read the operating mode
    pub async fn read_operation_mode(&self) -> Result<OperationMode, DeviceError> {
        let mask = self.slave.request_bill_operating_mode().await?;
        let mode = OperationMode::from_mask(mask);
        self.update_info(Property::OperationMode, |info| info.operation_mode = mode);
        Ok(mode)
    }

    /// Switch the operating mode and read it back
    pub async fn change_operation_mode(&self, mode: OperationMode) -> Result<OperationMode, DeviceError> {
        self.set_operation_mode(mode).await?;
        self.read_operation_mode().await
    }

    /// Issue a dispense command
    pub async fn master_dispense(
        &self,
        count: u8,
        slot: DispenseSlot,
        paymode: Paymode,
        strategy: PayoutStrategy,
        tan: u8,
    ) -> Result<DispenseResult, DeviceError> {
        let payload = [count, slot.code(), paymode as u8, strategy as u8, tan, tan];
        let data = self.exec(Md100Command::MasterDispense, &payload).await?;
        let mut result = DispenseResult::default();
        if let Some(&code) = data.first() {
            result.payout_code = code;
        }
        if let [_, count, slot, ..] = data[..] {
            result.previous_count = Some(count);
            result.previous_slot = Some(slot);
        }
        tracing::debug!("dispense {} x {:?}: {}", count, slot, result.description());
        Ok(result)
    }

    /// Read the fill size of every bill type and update the table
    pub async fn request_fill_sizes(&self) -> Result<Vec<u16>, DeviceError> {
        let data = self.exec(Md100Command::RequestFillSize, &[]).await?;
        let expected = 2 * BILL_TYPE_COUNT;
        if data.len() < expected {
            return Err(DeviceError::IncompleteMessage {
                command: "RequestFillSize",
                expected,
                received: data.len(),
            });
        }
        let sizes: Vec<u16> = data[..expected]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.bill_types.write().set_fill_sizes(&sizes);
        self.bill_types_updated();
        Ok(sizes)
    }
}

impl fmt::Debug for Md100 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Md100")
            .field("address", &self.slave.address())
            .field("state", &self.state())
            .field("operation", &self.is_operation_executing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_number_format() {
        assert_eq!(format_serial_number(&[0x01, 0x02, 0xFF]), "25521");
        assert_eq!(format_serial_number(&[]), "");
    }

    #[test]
    fn test_checksum_format() {
        assert_eq!(
            format_checksums(&[0x01, 0x02, 0x03, 0x04]),
            vec!["0403", "0201", "0000", "0000"]
        );
        assert_eq!(format_checksums(&[]).len(), 4);
    }

    #[test]
    fn test_software_revision_parts() {
        let mut raw = String::new();
        raw.push_str(&"A".repeat(32));
        raw.push_str(&"B".repeat(32));
        raw.push_str(&"C".repeat(32));
        raw.push_str("D1");
        raw.push('\u{3}');
        raw.push_str(&" ".repeat(29));

        let revision = SoftwareRevision::parse(&raw);
        assert_eq!(revision.firmware, "A".repeat(32));
        assert_eq!(revision.acceptor_head, "C".repeat(32));
        assert!(revision.dispenser.starts_with("D1<03> "));

        assert_eq!(SoftwareRevision::parse(""), SoftwareRevision::default());
    }

    #[test]
    fn test_operation_mode_bits() {
        assert_eq!(OperationMode::from_mask(0x10 | 0x01), OperationMode::Unload);
        assert_eq!(OperationMode::from_mask(0x20), OperationMode::Fill);
        assert_eq!(OperationMode::from_mask(0x4F), OperationMode::Game);
        assert_eq!(OperationMode::Unload.bits(), 16);
    }

    #[test]
    fn test_dispense_result_text() {
        let result = DispenseResult {
            payout_code: 0xA7,
            ..DispenseResult::default()
        };
        assert!(!result.is_ok());
        assert_eq!(result.description(), "false bill type or none filled");
        assert_eq!(DispenseResult::default().description(), "no errors");
    }

    #[test]
    fn test_dispense_slots() {
        assert_eq!(DispenseSlot::from_number(2), Some(DispenseSlot::Ss2));
        assert_eq!(DispenseSlot::Ss3.code(), 0x14);
        assert_eq!(DispenseSlot::from_code(0x12), Some(DispenseSlot::Ss1));
        assert_eq!(DispenseSlot::from_code(0x15), None);
    }

    #[test]
    fn test_date_time_format() {
        let t = chrono::NaiveDate::from_ymd_opt(2024, 3, 7)
            .and_then(|d| d.and_hms_opt(15, 4, 5))
            .unwrap();
        assert_eq!(t.format(DATE_TIME_FORMAT).to_string(), "070324150405");
    }
}
