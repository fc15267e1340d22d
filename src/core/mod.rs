//! Core module containing the ccTalk bus master
//!
//! This module provides:
//! - Frame codec and command vocabulary ([`protocol`])
//! - The transport engine serializing every exchange on the line ([`transport`])
//! - Slave devices: command dispatch, event tracking, macro operations and the
//!   MD-100 bill acceptor/dispenser ([`device`])

pub mod device;
pub mod protocol;
pub mod transport;
