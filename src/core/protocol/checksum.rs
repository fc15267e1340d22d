//! ccTalk simple checksum
//!
//! The checksum byte is chosen so that every byte of a frame, checksum
//! included, adds up to zero modulo 256.

/// Simple 8-bit sum
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Two's complement of the 8-bit sum (256 - sum mod 256)
pub fn simple_checksum(data: &[u8]) -> u8 {
    (!sum8(data)).wrapping_add(1)
}

/// Check that a complete frame sums to zero
pub fn verify_frame(frame: &[u8]) -> bool {
    !frame.is_empty() && sum8(frame) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_checksum() {
        // Simple poll from master 1 to address 2: 02 00 01 FE FF
        assert_eq!(simple_checksum(&[0x02, 0x00, 0x01, 0xFE]), 0xFF);
        assert_eq!(simple_checksum(&[]), 0x00);
        assert_eq!(simple_checksum(&[0x80, 0x80]), 0x00);
    }

    #[test]
    fn test_verify_frame() {
        assert!(verify_frame(&[0x02, 0x00, 0x01, 0xFE, 0xFF]));
        assert!(!verify_frame(&[0x02, 0x00, 0x01, 0xFE, 0xFE]));
        assert!(!verify_frame(&[]));
    }

    #[test]
    fn test_sum8_wraps() {
        assert_eq!(sum8(&[0xFF, 0x02]), 0x01);
    }
}
