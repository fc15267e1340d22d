//! ccTalk protocol layer
//!
//! Provides:
//! - Frame encoding/decoding ([`Message`])
//! - The simple 8-bit checksum
//! - Command and reply header vocabulary

pub mod checksum;
pub mod command;
pub mod message;

pub use command::{Command, ReplyHeader};
pub use message::{expected_frame_len, Message, MAX_DATA_LEN, MIN_FRAME_LEN};
