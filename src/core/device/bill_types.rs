//! Bill type table of the acceptor/dispenser
//!
//! Bill types are addressed by id `1..=21`. Each one is described by a
//! fixed-width ASCII string `CCVVVVIFFFFMMMMS`: country, value code, issue
//! code, fill size, maximum fill and slot state.

use super::DeviceError;
use serde::Serialize;

/// Number of bill types the device knows
pub const BILL_TYPE_COUNT: usize = 21;

/// Bill types whose inhibit bits mean "the acceptor takes money"
const ACCEPTOR_BILL_TYPES: std::ops::RangeInclusive<u8> = 1..=6;

/// Mask with every bill type bit set
pub const ALL_BILL_TYPES_MASK: u32 = (1 << BILL_TYPE_COUNT) - 1;

/// Availability reported in the last character of a bill id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillTypeState {
    /// '0'
    NotAvailable,
    /// '1'
    Locked,
    /// '2'
    Free,
    /// Anything else, including an empty reply
    #[default]
    Unknown,
}

impl BillTypeState {
    fn from_char(c: char) -> Self {
        match c {
            '0' => Self::NotAvailable,
            '1' => Self::Locked,
            '2' => Self::Free,
            _ => Self::Unknown,
        }
    }
}

/// One bill type
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BillType {
    /// Id `1..=21`
    pub id: u8,
    /// Inhibit bit is set
    pub enabled: bool,
    /// Two-letter country code
    pub country: String,
    /// Denomination in terms of the country scaling factor
    pub value_code: u32,
    /// Issue code
    pub issue_code: String,
    /// Bills of this type currently stored
    pub fill_size: u16,
    /// Capacity of the dispenser slot
    pub max_fill: u16,
    /// Slot state
    pub state: BillTypeState,
}

impl BillType {
    /// Empty bill type with only the id set
    pub fn empty(id: u8) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Parse a bill id string; missing or malformed fields stay empty/zero
    pub fn parse(id: u8, value: &str) -> Self {
        let field = |range: std::ops::Range<usize>| value.get(range).unwrap_or_default();
        let number = |range: std::ops::Range<usize>| field(range).trim().parse::<u32>().unwrap_or(0);
        Self {
            id,
            enabled: false,
            country: field(0..2).to_string(),
            value_code: number(2..6),
            issue_code: field(6..7).to_string(),
            fill_size: number(7..11) as u16,
            max_fill: number(11..15) as u16,
            state: field(15..16)
                .chars()
                .next()
                .map(BillTypeState::from_char)
                .unwrap_or_default(),
        }
    }
}

/// Build the bill id string written when reprogramming a dispenser slot
///
/// Issue code and fill size are zeroed, the state is set to free.
pub fn bill_id_string(country: &str, value_code: &str, max_fill: u16) -> Result<String, DeviceError> {
    if country.len() != 2 || !country.is_ascii() {
        return Err(DeviceError::InvalidArgument(format!(
            "country code '{country}' must be 2 ASCII characters"
        )));
    }
    if value_code.len() != 4 || !value_code.is_ascii() {
        return Err(DeviceError::InvalidArgument(format!(
            "value code '{value_code}' must be 4 ASCII characters"
        )));
    }
    if max_fill > 9999 {
        return Err(DeviceError::InvalidArgument(format!(
            "max fill {max_fill} does not fit into 4 digits"
        )));
    }
    Ok(format!("{country}{value_code}00000{max_fill:04}2"))
}

/// Decode three little-endian inhibit bytes into a bill type mask
pub fn mask_from_bytes(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(3)
        .enumerate()
        .fold(0, |mask, (i, &b)| mask | (u32::from(b) << (8 * i)))
}

/// Encode a bill type mask as three little-endian inhibit bytes
pub fn mask_to_bytes(mask: u32) -> [u8; 3] {
    let [b0, b1, b2, _] = mask.to_le_bytes();
    [b0, b1, b2]
}

/// All 21 bill types, addressed by 1-based id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillTypeTable {
    types: Vec<BillType>,
}

impl Default for BillTypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BillTypeTable {
    /// Table of empty bill types
    pub fn new() -> Self {
        Self {
            types: (1..=BILL_TYPE_COUNT as u8).map(BillType::empty).collect(),
        }
    }

    /// Bill type by id
    pub fn get(&self, id: u8) -> Option<&BillType> {
        self.types.get(usize::from(id).checked_sub(1)?)
    }

    /// Mutable bill type by id
    pub fn get_mut(&mut self, id: u8) -> Option<&mut BillType> {
        self.types.get_mut(usize::from(id).checked_sub(1)?)
    }

    /// Replace the entry with the same id, keeping its inhibit bit
    pub fn set(&mut self, mut bill: BillType) {
        if let Some(slot) = self.get_mut(bill.id) {
            bill.enabled = slot.enabled;
            *slot = bill;
        }
    }

    /// Iterate in id order
    pub fn iter(&self) -> impl Iterator<Item = &BillType> {
        self.types.iter()
    }

    /// Nominal value of a bill type, 0 for unknown ids
    pub fn nominal(&self, id: u8) -> u32 {
        self.get(id).map_or(0, |bill| bill.value_code)
    }

    /// Fill size of a bill type, 0 for unknown ids
    pub fn fill_size(&self, id: u8) -> u16 {
        self.get(id).map_or(0, |bill| bill.fill_size)
    }

    /// Current inhibit mask
    pub fn mask(&self) -> u32 {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, bill)| bill.enabled)
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    /// Set every inhibit bit from a mask
    pub fn set_mask(&mut self, mask: u32) {
        for (i, bill) in self.types.iter_mut().enumerate() {
            bill.enabled = (mask >> i) & 1 == 1;
        }
    }

    /// Set fill sizes in id order
    pub fn set_fill_sizes(&mut self, sizes: &[u16]) {
        for (bill, &size) in self.types.iter_mut().zip(sizes) {
            bill.fill_size = size;
        }
    }

    /// Whether any acceptor bill type is enabled
    pub fn is_accepting(&self) -> bool {
        ACCEPTOR_BILL_TYPES
            .filter_map(|id| self.get(id))
            .any(|bill| bill.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bill_id() {
        let bill = BillType::parse(3, "RU0100A001205002");
        assert_eq!(bill.country, "RU");
        assert_eq!(bill.value_code, 100);
        assert_eq!(bill.issue_code, "A");
        assert_eq!(bill.fill_size, 12);
        assert_eq!(bill.max_fill, 500);
        assert_eq!(bill.state, BillTypeState::Free);

        let bill = BillType::parse(18, "EU0050B001503001");
        assert_eq!(bill.value_code, 50);
        assert_eq!(bill.fill_size, 15);
        assert_eq!(bill.max_fill, 300);
        assert_eq!(bill.state, BillTypeState::Locked);
    }

    #[test]
    fn test_parse_empty_bill_id() {
        let bill = BillType::parse(7, "");
        assert_eq!(bill, BillType::empty(7));
        assert_eq!(bill.state, BillTypeState::Unknown);
    }

    #[test]
    fn test_bill_id_string() {
        let value = bill_id_string("RU", "0500", 300).unwrap();
        assert_eq!(value, "RU05000000003002");
        assert_eq!(BillType::parse(18, &value).max_fill, 300);
        assert!(bill_id_string("RUS", "0500", 300).is_err());
        assert!(bill_id_string("RU", "500", 300).is_err());
        assert!(bill_id_string("RU", "0500", 10_000).is_err());
    }

    #[test]
    fn test_mask_bytes() {
        assert_eq!(mask_to_bytes(0x1F_0203), [0x03, 0x02, 0x1F]);
        assert_eq!(mask_from_bytes(&[0x03, 0x02, 0x1F]), 0x1F_0203);
        assert_eq!(mask_from_bytes(&[0x01]), 0x01);
        assert_eq!(mask_from_bytes(&[]), 0);
    }

    #[test]
    fn test_table_addressing() {
        let mut table = BillTypeTable::new();
        assert!(table.get(0).is_none());
        assert!(table.get(22).is_none());
        assert_eq!(table.get(21).map(|b| b.id), Some(21));

        table.set(BillType::parse(2, "RU0010A000000002"));
        assert_eq!(table.nominal(2), 10);
        assert_eq!(table.nominal(40), 0);
    }

    #[test]
    fn test_mask_and_accepting() {
        let mut table = BillTypeTable::new();
        assert!(!table.is_accepting());

        table.set_mask(0b1_0000_0000);
        assert!(!table.is_accepting());
        assert_eq!(table.mask(), 0b1_0000_0000);

        table.set_mask(0b0010_0000);
        assert!(table.is_accepting());
        assert!(table.get(6).unwrap().enabled);

        table.set_mask(ALL_BILL_TYPES_MASK);
        assert_eq!(table.mask(), ALL_BILL_TYPES_MASK);
    }

    #[test]
    fn test_set_keeps_inhibit_bit() {
        let mut table = BillTypeTable::new();
        table.set_mask(0b100);
        table.set(BillType::parse(3, "RU0100A000000002"));
        assert!(table.get(3).unwrap().enabled);
    }

    #[test]
    fn test_fill_sizes() {
        let mut table = BillTypeTable::new();
        let mut sizes = vec![0u16; BILL_TYPE_COUNT];
        sizes[17] = 42;
        table.set_fill_sizes(&sizes);
        assert_eq!(table.fill_size(18), 42);
        assert_eq!(table.fill_size(1), 0);
    }
}
