//! Device events and the deduplicating event log
//!
//! The device reports its five most recent events on every poll. Consecutive
//! snapshots overlap, so the log keeps the last [`EventLog::CAPACITY`]
//! entries and only appends what it has not seen before.

use super::slave::EventBuffer;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Store locations that mean "a bill was taken in"
const ACCEPTING_LOCATIONS: [u8; 5] = [0x00, 0x01, 0x12, 0x13, 0x14];

/// Bill type ids reported with an accepted bill
const ACCEPTED_BILL_TYPES: std::ops::RangeInclusive<u8> = 1..=21;

/// Event code of a device error ('e')
const ERROR_CODE: u8 = b'e';

/// Coarse device state derived from the newest event
///
/// States are ordered by [`ordinal`](Self::ordinal); every state at or above
/// [`DeviceState::Idle`] is a ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceState {
    /// Event list is empty
    NoEvents,
    /// A bill reached the cashbox, escrow or a dispenser slot
    BillAccepted,
    /// Reset
    Reset,
    /// Connection to master
    Connect,
    /// Initialisation after reset
    Init,
    /// Married (encryption versions only)
    Marry,
    /// Firmware update active
    Update,
    /// Dispenser slot configuration
    Config,
    /// A bill is in transport
    Busy,
    /// Ready for work
    Idle,
    /// Acceptor globally locked
    Locked,
    /// Acceptor globally free
    Free,
    /// Bill moved to the cashbox after an error
    MoveToCashbox,
    /// Paid out bill waits at the front for removal
    MoveBill,
    /// Operating mode changed to fill
    ChangeToFill,
    /// Operating mode changed to unload
    ChangeToUnload,
    /// Operating mode changed to game
    ChangeToGame,
    /// Bill types modified
    ModifyTypes,
    /// A pay out of one bill was started
    PayMode,
    /// Device error with its number
    Error(u8),
    /// Unnamed hardware code
    Other(u8),
}

impl DeviceState {
    /// State for a hardware event code
    pub fn from_code(code: u8, data: u8) -> Self {
        match code {
            0x20 => Self::Reset,
            0x21 => Self::Connect,
            0x22 => Self::Init,
            0x23 => Self::Marry,
            0x24 => Self::Update,
            0x25 => Self::Config,
            0x26 => Self::Busy,
            0x27 => Self::Idle,
            0x28 => Self::Locked,
            0x29 => Self::Free,
            0x2A => Self::MoveToCashbox,
            0x2B => Self::MoveBill,
            0x2C => Self::ChangeToFill,
            0x2D => Self::ChangeToUnload,
            0x2E => Self::ChangeToGame,
            0x2F => Self::ModifyTypes,
            0x30 => Self::PayMode,
            ERROR_CODE => Self::Error(data),
            other => Self::Other(other),
        }
    }

    /// Position in the state order
    ///
    /// The two sentinels sit below every hardware code; hardware states use
    /// their event code.
    pub fn ordinal(&self) -> u16 {
        match self {
            Self::NoEvents => 0,
            Self::BillAccepted => 1,
            Self::Reset => 0x20,
            Self::Connect => 0x21,
            Self::Init => 0x22,
            Self::Marry => 0x23,
            Self::Update => 0x24,
            Self::Config => 0x25,
            Self::Busy => 0x26,
            Self::Idle => 0x27,
            Self::Locked => 0x28,
            Self::Free => 0x29,
            Self::MoveToCashbox => 0x2A,
            Self::MoveBill => 0x2B,
            Self::ChangeToFill => 0x2C,
            Self::ChangeToUnload => 0x2D,
            Self::ChangeToGame => 0x2E,
            Self::ModifyTypes => 0x2F,
            Self::PayMode => 0x30,
            Self::Error(_) => u16::from(ERROR_CODE),
            Self::Other(code) => u16::from(*code),
        }
    }

    /// Whether the device accepts commands in this state
    pub fn is_ready(&self) -> bool {
        self.ordinal() >= Self::Idle.ordinal()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(number) => write!(f, "Error(e{number})"),
            Self::Other(code) => write!(f, "Other({code:#04x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// One entry of the device's event history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceEvent {
    /// Event number assigned by the device
    pub number: u8,
    /// Raw `[code or store location, data or bill type]`
    pub data: [u8; 2],
    /// Already seen by a waiting operation
    #[serde(skip)]
    pub consumed: bool,
}

impl DeviceEvent {
    /// Create an unconsumed event
    pub fn new(number: u8, data: [u8; 2]) -> Self {
        Self {
            number,
            data,
            consumed: false,
        }
    }

    /// The "no events" marker
    pub fn no_events() -> Self {
        Self::new(0, [0, 0])
    }

    /// Classification of this event
    pub fn kind(&self) -> DeviceState {
        let [code, data] = self.data;
        if self.number == 0 && code == 0 && data == 0 {
            DeviceState::NoEvents
        } else if ACCEPTING_LOCATIONS.contains(&code) && ACCEPTED_BILL_TYPES.contains(&data) {
            DeviceState::BillAccepted
        } else {
            DeviceState::from_code(code, data)
        }
    }

    /// Bill type byte (meaningful for accepted bills)
    pub fn bill_type(&self) -> u8 {
        self.data[1]
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.kind())
    }
}

/// Convert a buffered-events reply into events, newest first
///
/// A zero counter yields the single "no events" marker; empty pairs are
/// skipped. Event numbers count down from the counter.
pub fn snapshot_from_buffer(buffer: &EventBuffer) -> Vec<DeviceEvent> {
    if buffer.counter == 0 {
        return vec![DeviceEvent::no_events()];
    }
    buffer
        .entries
        .iter()
        .zip(0u8..)
        .filter(|((code, data), _)| *code != 0 || *data != 0)
        .map(|(&(code, data), i)| DeviceEvent::new(buffer.counter.wrapping_sub(i), [code, data]))
        .collect()
}

/// Fixed-capacity ring of recent events, oldest first
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: VecDeque<DeviceEvent>,
}

impl EventLog {
    /// Number of entries kept
    pub const CAPACITY: usize = 5;

    /// Create an empty log
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(Self::CAPACITY),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest entry
    pub fn last(&self) -> Option<&DeviceEvent> {
        self.entries.back()
    }

    /// Entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &DeviceEvent> {
        self.entries.iter()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append, evicting the oldest entry when full
    pub fn push(&mut self, event: DeviceEvent) {
        if self.entries.len() >= Self::CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// How many trailing entries of a chronological snapshot are new
    ///
    /// Finds the smallest `n` for which the snapshot without its last `n`
    /// entries lines up, by event number, with the tail of the log.
    pub fn count_new(&self, snapshot: &[DeviceEvent]) -> usize {
        (0..=snapshot.len())
            .find(|&n| {
                let overlap = snapshot.len() - n;
                overlap <= self.entries.len()
                    && self
                        .entries
                        .iter()
                        .skip(self.entries.len() - overlap)
                        .map(|e| e.number)
                        .eq(snapshot[..overlap].iter().map(|e| e.number))
            })
            .unwrap_or(snapshot.len())
    }

    /// Scan newest to oldest for the first unconsumed entry of `target` kind
    ///
    /// Every unconsumed entry visited is marked consumed, matching or not.
    pub fn consume_until(&mut self, target: DeviceState) -> bool {
        for event in self.entries.iter_mut().rev() {
            if event.consumed {
                continue;
            }
            event.consumed = true;
            if event.kind() == target {
                return true;
            }
        }
        false
    }
}
