//! ccTalk command vocabulary
//!
//! Only the headers the master issues are listed; values are fixed by the
//! public ccTalk protocol documents.

/// ccTalk command headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Reset device (1)
    ResetDevice = 1,
    /// Request comms revision (4)
    RequestCommsRevision = 4,
    /// Request currency revision (145)
    RequestCurrencyRevision = 145,
    /// Request bill operating mode (152)
    RequestBillOperatingMode = 152,
    /// Modify bill operating mode (153)
    ModifyBillOperatingMode = 153,
    /// Request country scaling factor (156)
    RequestCountryScalingFactor = 156,
    /// Request bill id (157)
    RequestBillId = 157,
    /// Modify bill id (158)
    ModifyBillId = 158,
    /// Read buffered bill events (159)
    ReadBufferedBillEvents = 159,
    /// Request build code (192)
    RequestBuildCode = 192,
    /// Calculate ROM checksum (197)
    CalculateRomChecksum = 197,
    /// Request option flags (213)
    RequestOptionFlags = 213,
    /// Modify master inhibit status (228)
    ModifyMasterInhibitStatus = 228,
    /// Request inhibit status (230)
    RequestInhibitStatus = 230,
    /// Modify inhibit status (231)
    ModifyInhibitStatus = 231,
    /// Request software revision (241)
    RequestSoftwareRevision = 241,
    /// Request serial number (242)
    RequestSerialNumber = 242,
    /// Request product code (244)
    RequestProductCode = 244,
    /// Request equipment category id (245)
    RequestEquipmentCategoryId = 245,
    /// Request manufacturer id (246)
    RequestManufacturerId = 246,
    /// Simple poll (254)
    SimplePoll = 254,
}

impl Command {
    /// Get command from header byte
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Command::ResetDevice),
            4 => Some(Command::RequestCommsRevision),
            145 => Some(Command::RequestCurrencyRevision),
            152 => Some(Command::RequestBillOperatingMode),
            153 => Some(Command::ModifyBillOperatingMode),
            156 => Some(Command::RequestCountryScalingFactor),
            157 => Some(Command::RequestBillId),
            158 => Some(Command::ModifyBillId),
            159 => Some(Command::ReadBufferedBillEvents),
            192 => Some(Command::RequestBuildCode),
            197 => Some(Command::CalculateRomChecksum),
            213 => Some(Command::RequestOptionFlags),
            228 => Some(Command::ModifyMasterInhibitStatus),
            230 => Some(Command::RequestInhibitStatus),
            231 => Some(Command::ModifyInhibitStatus),
            241 => Some(Command::RequestSoftwareRevision),
            242 => Some(Command::RequestSerialNumber),
            244 => Some(Command::RequestProductCode),
            245 => Some(Command::RequestEquipmentCategoryId),
            246 => Some(Command::RequestManufacturerId),
            254 => Some(Command::SimplePoll),
            _ => None,
        }
    }

    /// Header byte
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Get name of command
    pub fn name(&self) -> &'static str {
        match self {
            Command::ResetDevice => "Reset device",
            Command::RequestCommsRevision => "Request comms revision",
            Command::RequestCurrencyRevision => "Request currency revision",
            Command::RequestBillOperatingMode => "Request bill operating mode",
            Command::ModifyBillOperatingMode => "Modify bill operating mode",
            Command::RequestCountryScalingFactor => "Request country scaling factor",
            Command::RequestBillId => "Request bill id",
            Command::ModifyBillId => "Modify bill id",
            Command::ReadBufferedBillEvents => "Read buffered bill events",
            Command::RequestBuildCode => "Request build code",
            Command::CalculateRomChecksum => "Calculate ROM checksum",
            Command::RequestOptionFlags => "Request option flags",
            Command::ModifyMasterInhibitStatus => "Modify master inhibit status",
            Command::RequestInhibitStatus => "Request inhibit status",
            Command::ModifyInhibitStatus => "Modify inhibit status",
            Command::RequestSoftwareRevision => "Request software revision",
            Command::RequestSerialNumber => "Request serial number",
            Command::RequestProductCode => "Request product code",
            Command::RequestEquipmentCategoryId => "Request equipment category id",
            Command::RequestManufacturerId => "Request manufacturer id",
            Command::SimplePoll => "Simple poll",
        }
    }
}

/// Header values a slave uses in replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyHeader {
    /// Acknowledge / return message (0)
    Ack = 0,
    /// Negative acknowledge (5)
    Nak = 5,
    /// Slave busy (6)
    Busy = 6,
}

impl ReplyHeader {
    /// Get reply header from byte
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReplyHeader::Ack),
            5 => Some(ReplyHeader::Nak),
            6 => Some(ReplyHeader::Busy),
            _ => None,
        }
    }
}
