//! # airsniff
//!
//! An 802.11 monitor-mode sniffer. Raw link-layer frames are read from one or
//! more capture interfaces, their radiotap pseudo-header is decoded, the
//! carried MAC frame is classified, and every access point and station seen on
//! the air is folded into a hashed tracking table.
//!
//! ## Architecture
//!
//! - `packet`: declarative header schemas and the generic pack/unpack routine
//! - `radiotap`: presence-bitmap driven radiotap decoder
//! - `ieee80211`: MAC frame decoder used behind the radiotap layer
//! - `station`: station/access point tracking table
//! - `channel`: channel plan and periodic channel hopping
//! - `transport`: upstream reporting messages and report timers
//! - `daemon`: single-threaded event loop, sockets, configuration and the
//!   sniffer orchestrator

pub mod packet;
pub mod radiotap;
pub mod ieee80211;
pub mod station;
pub mod channel;
pub mod transport;

// Daemon modules
pub mod daemon;

// Re-export commonly used types
pub use crate::{
    packet::{ByteOrder, Encode, Header, HeaderSchema, Packet, Payload, Value},
    radiotap::{Radiotap, RadiotapField, OptionalField},
    ieee80211::{FrameDecoder, Ieee80211Decoder, MacAddr, MacFrame},
    station::{StationKind, StationRecord, StationTable},
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnifferError {
    #[error("insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported field: {0}")]
    UnsupportedField(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl SnifferError {
    /// True when the input was merely short, so the caller may retry with
    /// more bytes instead of treating the input as garbage.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, SnifferError::InsufficientData { .. })
    }
}

pub type Result<T> = std::result::Result<T, SnifferError>;

// Constants
pub const RADIOTAP_VERSION: u8 = 0;
pub const MAX_FRAME_SIZE: usize = 4096;
pub const DEFAULT_CTRL_IFACE: &str = "/tmp/sniffer.sock";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(RADIOTAP_VERSION, 0);
        assert_eq!(DEFAULT_CTRL_IFACE, "/tmp/sniffer.sock");
    }

    #[test]
    fn test_incomplete_is_distinct() {
        let short = SnifferError::InsufficientData { needed: 8, available: 3 };
        let bad = SnifferError::MalformedHeader("bad".to_string());
        assert!(short.is_incomplete());
        assert!(!bad.is_incomplete());
    }
}
