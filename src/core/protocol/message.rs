//! ccTalk wire message
//!
//! Frame layout: `DEST | LEN | SRC | HEADER | DATA[LEN] | CHECKSUM`.
//! The length byte is derived from the payload and the checksum from the
//! whole frame, so neither is stored on [`Message`].

use super::checksum;
use crate::core::transport::TransportError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Offset of the destination address
pub const POS_DEST: usize = 0;
/// Offset of the data length byte
pub const POS_LEN: usize = 1;
/// Offset of the source address
pub const POS_SOURCE: usize = 2;
/// Offset of the header (command) byte
pub const POS_HEADER: usize = 3;
/// Offset of the first data byte
pub const POS_DATA: usize = 4;
/// Frame length with an empty payload
pub const MIN_FRAME_LEN: usize = 5;
/// Largest payload the length byte can describe
pub const MAX_DATA_LEN: usize = u8::MAX as usize;

/// A single ccTalk message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Destination address
    pub destination: u8,
    /// Source address
    pub source: u8,
    /// Header (command code, or 0 for a reply)
    pub header: u8,
    data: Vec<u8>,
}

impl Message {
    /// Create a message without payload
    pub fn new(destination: u8, source: u8, header: u8) -> Self {
        Self {
            destination,
            source,
            header,
            data: Vec::new(),
        }
    }

    /// Attach a payload
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Result<Self, TransportError> {
        let data = data.into();
        if data.len() > MAX_DATA_LEN {
            return Err(TransportError::PayloadTooLong(data.len()));
        }
        self.data = data;
        Ok(self)
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the message and return its payload
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Value of the length byte
    #[allow(clippy::cast_possible_truncation)]
    pub fn data_len(&self) -> u8 {
        // bounded by MAX_DATA_LEN on construction
        self.data.len() as u8
    }

    /// Checksum byte of the encoded frame
    pub fn checksum(&self) -> u8 {
        let head = [self.destination, self.data_len(), self.source, self.header];
        checksum::simple_checksum(&[checksum::sum8(&head), checksum::sum8(&self.data)])
    }

    /// Total number of bytes on the wire
    pub fn frame_len(&self) -> usize {
        MIN_FRAME_LEN + self.data.len()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        buf.put_u8(self.destination);
        buf.put_u8(self.data_len());
        buf.put_u8(self.source);
        buf.put_u8(self.header);
        buf.put_slice(&self.data);
        buf.put_u8(self.checksum());
        buf.freeze()
    }

    /// Decode one complete, checksummed frame
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        match expected_frame_len(frame) {
            Some(len) if len == frame.len() => {}
            _ => {
                return Err(TransportError::InvalidFrame(format!(
                    "{} bytes do not form a complete frame",
                    frame.len()
                )))
            }
        }
        if !checksum::verify_frame(frame) {
            return Err(TransportError::InvalidChecksum(hex::encode_upper(frame)));
        }
        Ok(Self::from_complete(frame))
    }

    /// Best-effort message from a truncated frame
    ///
    /// Addresses and header are filled in when enough bytes arrived; the
    /// payload is only taken when more than a bare preamble was read.
    pub fn from_partial(buffer: &[u8]) -> Self {
        let byte_at = |pos: usize, needed: usize| {
            if buffer.len() >= needed {
                buffer[pos]
            } else {
                0
            }
        };
        let mut message = Self::new(
            byte_at(POS_DEST, 1),
            byte_at(POS_SOURCE, 3),
            byte_at(POS_HEADER, 4),
        );
        if buffer.len() > MIN_FRAME_LEN {
            let end = (POS_DATA + buffer[POS_LEN] as usize).min(buffer.len());
            message.data = buffer[POS_DATA..end].to_vec();
        }
        message
    }

    fn from_complete(frame: &[u8]) -> Self {
        let end = POS_DATA + frame[POS_LEN] as usize;
        Self {
            destination: frame[POS_DEST],
            source: frame[POS_SOURCE],
            header: frame[POS_HEADER],
            data: frame[POS_DATA..end].to_vec(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} -> {:02X} hdr {} [{}]",
            self.source,
            self.destination,
            self.header,
            hex::encode_upper(&self.data)
        )
    }
}

/// Full frame length announced by a partially received buffer
///
/// `None` until the length byte has arrived.
pub fn expected_frame_len(buffer: &[u8]) -> Option<usize> {
    buffer
        .get(POS_LEN)
        .map(|&len| MIN_FRAME_LEN + len as usize)
}
