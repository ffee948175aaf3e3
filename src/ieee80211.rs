//! IEEE 802.11 MAC frame decoding
//!
//! Only what tracking needs is decoded: frame type and subtype, the address
//! fields, DS direction bits, and the SSID and DS parameter elements of
//! beacons and probe responses. The raw frame is kept so it re-encodes
//! unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::str::FromStr;

use crate::packet::{bits, ByteOrder, Encode, Header};
use crate::{wire_header, Result, SnifferError};

/// Length of a trailing frame check sequence
pub const FCS_LEN: usize = 4;

/// Management subtypes the sniffer acts on
pub mod subtype {
    pub const ASSOC_REQUEST: u8 = 0;
    pub const REASSOC_REQUEST: u8 = 2;
    pub const PROBE_REQUEST: u8 = 4;
    pub const PROBE_RESPONSE: u8 = 5;
    pub const BEACON: u8 = 8;
    pub const AUTHENTICATION: u8 = 11;
}

/// Information element ids
pub mod element {
    pub const SSID: u8 = 0;
    pub const DS_PARAMS: u8 = 3;
}

pub const TO_DS: u8 = 0x01;
pub const FROM_DS: u8 = 0x02;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group addresses, broadcast included
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| SnifferError::InvalidParameter(format!("short MAC address: {}", s)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| SnifferError::InvalidParameter(format!("bad MAC address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(SnifferError::InvalidParameter(format!("long MAC address: {}", s)));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

/// Frame type (2 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Management = 0,
    Control = 1,
    Data = 2,
    Extension = 3,
}

impl From<u8> for FrameType {
    fn from(val: u8) -> Self {
        match val & 0x03 {
            0 => FrameType::Management,
            1 => FrameType::Control,
            2 => FrameType::Data,
            _ => FrameType::Extension,
        }
    }
}

wire_header! {
    /// Three-address MAC header shared by management and data frames
    pub struct MacHeader(ByteOrder::Little) {
        pub fc: u8 = 0,
        pub fc_flags: u8 = 0,
        pub duration: u16 = 0,
        pub addr1: [u8; 6] = [0; 6],
        pub addr2: [u8; 6] = [0; 6],
        pub addr3: [u8; 6] = [0; 6],
        pub seq_ctrl: u16 = 0,
    }
}

wire_header! {
    struct FrameControl(ByteOrder::Little) {
        fc: u8 = 0,
        flags: u8 = 0,
    }
}

wire_header! {
    struct ElementHeader(ByteOrder::Big) {
        id: u8 = 0,
        len: u8 = 0,
    }
}

/// Addresses and elements of a management frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtFields {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub bssid: MacAddr,
    /// SSID element, beacons and probe responses only
    pub ssid: Option<Bytes>,
    /// Current channel from the DS parameter element
    pub ds: Option<u8>,
}

/// Direction bits and addresses of a data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFields {
    pub to_ds: bool,
    pub from_ds: bool,
    pub bssid: MacAddr,
    pub src: MacAddr,
    pub dst: MacAddr,
}

/// A decoded 802.11 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacFrame {
    pub frame_type: FrameType,
    pub subtype: u8,
    pub mgmt: Option<MgmtFields>,
    pub data: Option<DataFields>,
    raw: Bytes,
}

impl MacFrame {
    pub fn is_management(&self) -> bool {
        self.frame_type == FrameType::Management
    }

    pub fn is_data(&self) -> bool {
        self.frame_type == FrameType::Data
    }

    pub fn ssid(&self) -> Option<&[u8]> {
        self.mgmt.as_ref()?.ssid.as_deref()
    }

    /// SSID as text, lossily converted
    pub fn ssid_lossy(&self) -> Option<String> {
        self.ssid().map(|s| String::from_utf8_lossy(s).into_owned())
    }

    pub fn channel(&self) -> Option<u8> {
        self.mgmt.as_ref()?.ds
    }

    /// The frame exactly as captured
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

impl Encode for MacFrame {
    fn encode_into(&self, out: &mut BytesMut) -> Result<()> {
        out.put_slice(&self.raw);
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        self.raw.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// MAC frame decoder sitting behind the radiotap layer
pub trait FrameDecoder {
    /// Decode `payload`; `fcs` says whether it ends in a 4-byte FCS
    fn decode(&self, payload: &[u8], fcs: bool) -> Result<MacFrame>;
}

/// Default decoder covering management and data frames
#[derive(Debug, Clone, Copy, Default)]
pub struct Ieee80211Decoder;

impl FrameDecoder for Ieee80211Decoder {
    fn decode(&self, payload: &[u8], fcs: bool) -> Result<MacFrame> {
        let body = if fcs {
            let end = payload.len().checked_sub(FCS_LEN).ok_or(SnifferError::InsufficientData {
                needed: FCS_LEN,
                available: payload.len(),
            })?;
            &payload[..end]
        } else {
            payload
        };

        let (control, _) = FrameControl::unpack(body)?;
        let frame_type = FrameType::from(control.fc >> 2);
        let subtype = control.fc >> 4;

        let mut frame = MacFrame {
            frame_type,
            subtype,
            mgmt: None,
            data: None,
            raw: Bytes::copy_from_slice(payload),
        };

        match frame_type {
            FrameType::Management => {
                let (header, rest) = MacHeader::unpack(body)?;
                frame.mgmt = Some(decode_mgmt(&header, subtype, rest)?);
            }
            FrameType::Data => {
                let (header, _) = MacHeader::unpack(body)?;
                frame.data = Some(decode_data(&header));
            }
            FrameType::Control | FrameType::Extension => {}
        }

        Ok(frame)
    }
}

fn decode_mgmt(header: &MacHeader, subtype: u8, body: &[u8]) -> Result<MgmtFields> {
    let mut fields = MgmtFields {
        dst: MacAddr(header.addr1),
        src: MacAddr(header.addr2),
        bssid: MacAddr(header.addr3),
        ssid: None,
        ds: None,
    };

    if subtype == subtype::BEACON || subtype == subtype::PROBE_RESPONSE {
        // timestamp, beacon interval, capability
        let fixed = 12;
        if body.len() < fixed {
            return Err(SnifferError::InsufficientData {
                needed: fixed,
                available: body.len(),
            });
        }

        for (id, value) in elements(&body[fixed..]) {
            match id {
                element::SSID if fields.ssid.is_none() => {
                    fields.ssid = Some(Bytes::copy_from_slice(value));
                }
                element::DS_PARAMS if value.len() == 1 => fields.ds = Some(value[0]),
                _ => {}
            }
        }
    }

    Ok(fields)
}

fn decode_data(header: &MacHeader) -> DataFields {
    let to_ds = bits::get(header.fc_flags, TO_DS);
    let from_ds = bits::get(header.fc_flags, FROM_DS);
    let (a1, a2, a3) = (
        MacAddr(header.addr1),
        MacAddr(header.addr2),
        MacAddr(header.addr3),
    );

    // WDS frames carry a fourth address that is not parsed
    let (bssid, src, dst) = match (to_ds, from_ds) {
        (false, false) => (a3, a2, a1),
        (true, false) => (a1, a2, a3),
        (false, true) => (a2, a3, a1),
        (true, true) => (a1, a2, a3),
    };

    DataFields { to_ds, from_ds, bssid, src, dst }
}

/// Walk information elements, stopping at the first truncated one
fn elements(mut buf: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    std::iter::from_fn(move || {
        let (el, rest) = ElementHeader::unpack(buf).ok()?;
        let len = el.len as usize;
        if rest.len() < len {
            return None;
        }
        let (value, tail) = rest.split_at(len);
        buf = tail;
        Some((el.id, value))
    })
}
