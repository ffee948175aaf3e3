//! Radiotap header parsing
//!
//! The fixed header is followed by a chain of presence words and then by the
//! optional fields the chain flags, packed back to back in ascending bit
//! order. Nothing on the wire describes a field's length, so the decoder
//! walks the bits in order and consumes each field's schema in turn.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use std::fmt;

use crate::ieee80211::{FrameDecoder, Ieee80211Decoder, MacFrame};
use crate::packet::{bits, ByteOrder, Header, Payload};
use crate::{wire_header, Result, SnifferError};

/// Continuation bit of every presence word
pub const PRESENT_EXT: u32 = 1 << 31;

/// Highest presence bit with a known field layout
pub const MAX_DECODED_BIT: u32 = 14;

wire_header! {
    /// Fixed radiotap header
    pub struct RadiotapHeader(ByteOrder::Little) {
        pub version: u8 = crate::RADIOTAP_VERSION,
        pub pad: u8 = 0,
        /// Declared length of header plus optional fields
        pub length: u16 = 8,
        pub present: u32 = 0,
    }
}

impl RadiotapHeader {
    pub fn is_present(&self, kind: RadiotapField) -> bool {
        bits::get(self.present, kind.mask())
    }

    pub fn set_present(&mut self, kind: RadiotapField, on: bool) {
        self.present = bits::with(self.present, kind.mask(), on);
    }

    pub fn has_extension(&self) -> bool {
        bits::get(self.present, PRESENT_EXT)
    }
}

/// Channel flags
pub mod channel_flags {
    pub const TURBO: u16 = 0x0010;
    pub const CCK: u16 = 0x0020;
    pub const OFDM: u16 = 0x0040;
    pub const SPECTRUM_2GHZ: u16 = 0x0080;
    pub const SPECTRUM_5GHZ: u16 = 0x0100;
    pub const PASSIVE: u16 = 0x0200;
    pub const DYN: u16 = 0x0400;
    pub const GFSK: u16 = 0x0800;
}

/// Flags field bits
pub mod flag_bits {
    pub const CFP: u8 = 0x01;
    pub const SHORT_PREAMBLE: u8 = 0x02;
    pub const WEP: u8 = 0x04;
    pub const FRAGMENTED: u8 = 0x08;
    pub const FCS: u8 = 0x10;
    pub const DATA_PAD: u8 = 0x20;
    pub const BAD_FCS: u8 = 0x40;
    pub const SHORT_GI: u8 = 0x80;
}

wire_header! {
    pub struct Tsft(ByteOrder::Big) {
        pub usecs: u64 = 0,
    }
}

wire_header! {
    pub struct Flags(ByteOrder::Big) {
        pub val: u8 = 0,
    }
}

wire_header! {
    /// Data rate in 500 kbps units
    pub struct Rate(ByteOrder::Big) {
        pub val: u8 = 0,
    }
}

wire_header! {
    pub struct Channel(ByteOrder::Big) {
        pub freq: u16 = 0,
        pub flags: u16 = 0,
    }
}

wire_header! {
    pub struct Fhss(ByteOrder::Big) {
        pub set: u8 = 0,
        pub pattern: u8 = 0,
    }
}

wire_header! {
    pub struct AntennaSignal(ByteOrder::Big) {
        pub db: u8 = 0,
    }
}

wire_header! {
    pub struct AntennaNoise(ByteOrder::Big) {
        pub db: u8 = 0,
    }
}

wire_header! {
    pub struct LockQuality(ByteOrder::Big) {
        pub val: u16 = 0,
    }
}

wire_header! {
    pub struct TxAttenuation(ByteOrder::Big) {
        pub val: u16 = 0,
    }
}

wire_header! {
    pub struct DbTxAttenuation(ByteOrder::Big) {
        pub db: u16 = 0,
    }
}

wire_header! {
    pub struct DbmTxPower(ByteOrder::Big) {
        pub dbm: u8 = 0,
    }
}

wire_header! {
    pub struct Antenna(ByteOrder::Big) {
        pub index: u8 = 0,
    }
}

wire_header! {
    pub struct DbAntennaSignal(ByteOrder::Big) {
        pub db: u8 = 0,
    }
}

wire_header! {
    pub struct DbAntennaNoise(ByteOrder::Big) {
        pub db: u8 = 0,
    }
}

wire_header! {
    pub struct RxFlags(ByteOrder::Big) {
        pub val: u16 = 0,
    }
}

impl Flags {
    pub fn cfp(&self) -> bool {
        bits::get(self.val, flag_bits::CFP)
    }

    pub fn set_cfp(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::CFP, on);
    }

    pub fn short_preamble(&self) -> bool {
        bits::get(self.val, flag_bits::SHORT_PREAMBLE)
    }

    pub fn set_short_preamble(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::SHORT_PREAMBLE, on);
    }

    pub fn wep(&self) -> bool {
        bits::get(self.val, flag_bits::WEP)
    }

    pub fn set_wep(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::WEP, on);
    }

    pub fn fragmented(&self) -> bool {
        bits::get(self.val, flag_bits::FRAGMENTED)
    }

    pub fn set_fragmented(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::FRAGMENTED, on);
    }

    /// Frame carries a trailing FCS. Read-only: it describes captured input.
    pub fn fcs(&self) -> bool {
        bits::get(self.val, flag_bits::FCS)
    }

    pub fn data_pad(&self) -> bool {
        bits::get(self.val, flag_bits::DATA_PAD)
    }

    pub fn set_data_pad(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::DATA_PAD, on);
    }

    pub fn bad_fcs(&self) -> bool {
        bits::get(self.val, flag_bits::BAD_FCS)
    }

    pub fn set_bad_fcs(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::BAD_FCS, on);
    }

    pub fn short_gi(&self) -> bool {
        bits::get(self.val, flag_bits::SHORT_GI)
    }

    pub fn set_short_gi(&mut self, on: bool) {
        self.val = bits::with(self.val, flag_bits::SHORT_GI, on);
    }
}

impl Channel {
    pub fn is_2ghz(&self) -> bool {
        bits::get(self.flags, channel_flags::SPECTRUM_2GHZ)
    }

    pub fn is_5ghz(&self) -> bool {
        bits::get(self.flags, channel_flags::SPECTRUM_5GHZ)
    }

    pub fn is_ofdm(&self) -> bool {
        bits::get(self.flags, channel_flags::OFDM)
    }

    pub fn is_cck(&self) -> bool {
        bits::get(self.flags, channel_flags::CCK)
    }
}

macro_rules! optional_fields {
    ($( $bit:literal => $variant:ident ),* $(,)?) => {
        /// Optional fields with a known layout, by presence bit
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum RadiotapField {
            $( $variant = $bit, )*
        }

        impl RadiotapField {
            /// Canonical decode order
            pub const ALL: &'static [RadiotapField] = &[ $( RadiotapField::$variant, )* ];

            pub fn from_bit(bit: u32) -> Option<Self> {
                match bit {
                    $( $bit => Some(RadiotapField::$variant), )*
                    _ => None,
                }
            }

            /// Fixed encoded width of the field
            pub fn width(self) -> usize {
                match self {
                    $( RadiotapField::$variant => <$variant as Header>::encoded_len(), )*
                }
            }
        }

        /// A decoded optional field
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum OptionalField {
            $( $variant($variant), )*
        }

        impl OptionalField {
            pub fn kind(&self) -> RadiotapField {
                match self {
                    $( OptionalField::$variant(_) => RadiotapField::$variant, )*
                }
            }

            fn unpack(kind: RadiotapField, buf: &[u8]) -> Result<(Self, &[u8])> {
                match kind {
                    $(
                        RadiotapField::$variant => {
                            let (field, rest) = $variant::unpack(buf)?;
                            Ok((OptionalField::$variant(field), rest))
                        }
                    )*
                }
            }

            fn pack_into(&self, out: &mut BytesMut) -> Result<()> {
                match self {
                    $( OptionalField::$variant(field) => field.pack_into(out), )*
                }
            }

            pub fn encoded_len(&self) -> usize {
                self.kind().width()
            }
        }

        $(
            impl From<$variant> for OptionalField {
                fn from(field: $variant) -> Self {
                    OptionalField::$variant(field)
                }
            }
        )*
    };
}

optional_fields! {
    0 => Tsft,
    1 => Flags,
    2 => Rate,
    3 => Channel,
    4 => Fhss,
    5 => AntennaSignal,
    6 => AntennaNoise,
    7 => LockQuality,
    8 => TxAttenuation,
    9 => DbTxAttenuation,
    10 => DbmTxPower,
    11 => Antenna,
    12 => DbAntennaSignal,
    13 => DbAntennaNoise,
    14 => RxFlags,
}

impl RadiotapField {
    pub const fn bit(self) -> u32 {
        self as u32
    }

    pub const fn mask(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for RadiotapField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(bit {})", self, self.bit())
    }
}

/// Logical presence bitmap built from the whole word chain.
///
/// Word `n` contributes its bits at offset `n * 8`; later words extend the
/// bitmap and never clear a bit set by an earlier word.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceBitmap {
    words: Vec<u32>,
}

impl PresenceBitmap {
    pub fn new(words: Vec<u32>) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn is_set(&self, bit: u32) -> bool {
        let bit = bit as u64;
        self.words.iter().enumerate().any(|(n, word)| {
            let offset = n as u64 * 8;
            bit >= offset && bit - offset < 32 && (*word >> (bit - offset)) & 1 == 1
        })
    }

    /// The bitmap as a single integer, dropping whatever does not fit
    pub fn value(&self) -> u128 {
        self.words
            .iter()
            .enumerate()
            .fold(0u128, |acc, (n, word)| {
                acc | (*word as u128)
                    .checked_shl(n as u32 * 8)
                    .unwrap_or(0)
            })
    }

    /// Set bits of the decoded range, ascending
    pub fn decoded(&self) -> impl Iterator<Item = RadiotapField> + '_ {
        RadiotapField::ALL
            .iter()
            .copied()
            .filter(|kind| self.is_set(kind.bit()))
    }
}

/// A decoded radiotap frame
#[derive(Debug, PartialEq)]
pub struct Radiotap {
    pub header: RadiotapHeader,
    /// Presence words after the first one
    pub extensions: Vec<u32>,
    /// Optional fields in ascending bit order
    pub fields: Vec<OptionalField>,
    /// Bytes between the last decoded field and the declared length
    pub trailer: Bytes,
    pub payload: Payload,
}

impl Default for Radiotap {
    fn default() -> Self {
        Self {
            header: RadiotapHeader::default(),
            extensions: Vec::new(),
            fields: Vec::new(),
            trailer: Bytes::new(),
            payload: Payload::empty(),
        }
    }
}

impl Radiotap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a capture, handing the payload to the default MAC decoder
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_with(buf, &Ieee80211Decoder)
    }

    /// Decode the radiotap layer only, leaving the payload raw
    pub fn decode_raw(buf: &[u8]) -> Result<Self> {
        let (header, mut rest) = RadiotapHeader::unpack(buf)?;

        let mut extensions = Vec::new();
        let mut last = header.present;
        while bits::get(last, PRESENT_EXT) {
            let (word, tail) = PresenceWord::unpack(rest)?;
            last = word.value;
            extensions.push(word.value);
            rest = tail;
        }

        let presence = PresenceBitmap::new(
            std::iter::once(header.present)
                .chain(extensions.iter().copied())
                .collect(),
        );

        let mut fields = Vec::new();
        for kind in presence.decoded() {
            let (field, tail) = OptionalField::unpack(kind, rest)?;
            fields.push(field);
            rest = tail;
        }

        let cursor = buf.len() - rest.len();
        let declared = header.length as usize;
        let (trailer, payload) = if declared > buf.len() {
            (&buf[cursor..], &buf[buf.len()..])
        } else if cursor > declared {
            return Err(SnifferError::MalformedHeader(format!(
                "radiotap fields end at {} past declared length {}",
                cursor, declared
            )));
        } else {
            (&buf[cursor..declared], &buf[declared..])
        };

        Ok(Self {
            header,
            extensions,
            fields,
            trailer: Bytes::copy_from_slice(trailer),
            payload: Payload::Raw(Bytes::copy_from_slice(payload)),
        })
    }

    /// Decode a capture and hand a non-empty payload to `decoder`
    pub fn decode_with(buf: &[u8], decoder: &dyn FrameDecoder) -> Result<Self> {
        let mut radiotap = Self::decode_raw(buf)?;
        if let Some(raw) = radiotap.payload.as_raw().filter(|raw| !raw.is_empty()).cloned() {
            let frame = decoder.decode(&raw, radiotap.fcs_present())?;
            radiotap.payload = Payload::Nested(Box::new(frame));
        }
        Ok(radiotap)
    }

    pub fn presence(&self) -> PresenceBitmap {
        PresenceBitmap::new(
            std::iter::once(self.header.present)
                .chain(self.extensions.iter().copied())
                .collect(),
        )
    }

    pub fn is_present(&self, kind: RadiotapField) -> bool {
        self.presence().is_set(kind.bit())
    }

    /// Presence bits set in the chain that this decoder does not understand
    pub fn undecoded_bits(&self) -> Vec<u32> {
        let mut out = BTreeSet::new();
        for (n, word) in std::iter::once(self.header.present)
            .chain(self.extensions.iter().copied())
            .enumerate()
        {
            for bit in 0..31 {
                let logical = n as u32 * 8 + bit;
                if word & (1 << bit) != 0 && logical > MAX_DECODED_BIT {
                    out.insert(logical);
                }
            }
        }
        out.into_iter().collect()
    }

    pub fn field(&self, kind: RadiotapField) -> Option<&OptionalField> {
        self.fields.iter().find(|f| f.kind() == kind)
    }

    /// Add or replace an optional field, keeping ascending order and the
    /// declared length in step.
    pub fn set_field(&mut self, field: impl Into<OptionalField>) {
        let field = field.into();
        let kind = field.kind();
        match self.fields.binary_search_by_key(&kind, |f| f.kind()) {
            Ok(i) => self.fields[i] = field,
            Err(i) => self.fields.insert(i, field),
        }
        self.header.set_present(kind, true);
        self.sync_length();
    }

    pub fn remove_field(&mut self, kind: RadiotapField) -> Option<OptionalField> {
        let i = self.fields.iter().position(|f| f.kind() == kind)?;
        self.header.set_present(kind, false);
        let removed = self.fields.remove(i);
        self.sync_length();
        Some(removed)
    }

    fn sync_length(&mut self) {
        let length = RadiotapHeader::encoded_len()
            + self.extensions.len() * 4
            + self.fields.iter().map(|f| f.encoded_len()).sum::<usize>()
            + self.trailer.len();
        self.header.length = u16::try_from(length).unwrap_or(u16::MAX);
    }

    pub fn tsft(&self) -> Option<&Tsft> {
        match self.field(RadiotapField::Tsft)? {
            OptionalField::Tsft(f) => Some(f),
            _ => None,
        }
    }

    pub fn flags(&self) -> Option<&Flags> {
        match self.field(RadiotapField::Flags)? {
            OptionalField::Flags(f) => Some(f),
            _ => None,
        }
    }

    pub fn flags_mut(&mut self) -> Option<&mut Flags> {
        self.fields.iter_mut().find_map(|f| match f {
            OptionalField::Flags(flags) => Some(flags),
            _ => None,
        })
    }

    pub fn rate(&self) -> Option<&Rate> {
        match self.field(RadiotapField::Rate)? {
            OptionalField::Rate(f) => Some(f),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&Channel> {
        match self.field(RadiotapField::Channel)? {
            OptionalField::Channel(f) => Some(f),
            _ => None,
        }
    }

    pub fn antenna_signal(&self) -> Option<&AntennaSignal> {
        match self.field(RadiotapField::AntennaSignal)? {
            OptionalField::AntennaSignal(f) => Some(f),
            _ => None,
        }
    }

    pub fn antenna_noise(&self) -> Option<&AntennaNoise> {
        match self.field(RadiotapField::AntennaNoise)? {
            OptionalField::AntennaNoise(f) => Some(f),
            _ => None,
        }
    }

    pub fn antenna(&self) -> Option<&Antenna> {
        match self.field(RadiotapField::Antenna)? {
            OptionalField::Antenna(f) => Some(f),
            _ => None,
        }
    }

    pub fn rx_flags(&self) -> Option<&RxFlags> {
        match self.field(RadiotapField::RxFlags)? {
            OptionalField::RxFlags(f) => Some(f),
            _ => None,
        }
    }

    /// FCS flag from the Flags field, false when Flags is absent
    pub fn fcs_present(&self) -> bool {
        self.flags().map(Flags::fcs).unwrap_or(false)
    }

    /// Signal strength in dBm, when the capture carries it
    pub fn signal_dbm(&self) -> Option<i8> {
        self.antenna_signal().map(|s| s.db as i8)
    }

    /// The nested MAC frame, if the payload was decoded
    pub fn mac_frame(&self) -> Option<&MacFrame> {
        self.payload.nested::<MacFrame>()
    }

    fn check_layout(&self) -> Result<()> {
        let words = std::iter::once(self.header.present).chain(self.extensions.iter().copied());
        let last = self.extensions.len();
        for (n, word) in words.enumerate() {
            if bits::get(word, PRESENT_EXT) != (n < last) {
                return Err(SnifferError::MalformedHeader(format!(
                    "presence word {} continuation bit does not match {} extension words",
                    n, last
                )));
            }
        }

        let presence = self.presence();
        for pair in self.fields.windows(2) {
            if pair[0].kind() >= pair[1].kind() {
                return Err(SnifferError::MalformedHeader(format!(
                    "{} must precede {}",
                    pair[1].kind(),
                    pair[0].kind()
                )));
            }
        }

        for field in &self.fields {
            if !presence.is_set(field.kind().bit()) {
                return Err(SnifferError::UnsupportedField(format!(
                    "{} is not flagged present",
                    field.kind()
                )));
            }
        }

        for kind in presence.decoded() {
            if self.field(kind).is_none() {
                return Err(SnifferError::UnsupportedField(format!(
                    "{} flagged present without a value",
                    kind
                )));
            }
        }

        Ok(())
    }

    /// Serialize header, presence chain, fields, trailer and payload
    pub fn encode(&self) -> Result<Bytes> {
        self.check_layout()?;

        let mut out = BytesMut::with_capacity(self.len());
        self.header.pack_into(&mut out)?;
        for word in &self.extensions {
            out.put_u32_le(*word);
        }
        for field in &self.fields {
            field.pack_into(&mut out)?;
        }
        out.put_slice(&self.trailer);
        self.payload.encode_into(&mut out)?;
        Ok(out.freeze())
    }

    pub fn len(&self) -> usize {
        RadiotapHeader::encoded_len()
            + self.extensions.len() * 4
            + self.fields.iter().map(|f| f.encoded_len()).sum::<usize>()
            + self.trailer.len()
            + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

wire_header! {
    /// One extension presence word
    struct PresenceWord(ByteOrder::Little) {
        value: u32 = 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ieee80211::FrameType;
    use crate::packet::assert_codec_roundtrip;
    use proptest::prelude::*;

    const CAPTURE_A: [u8; 24] = [
        0x00, 0x00, 0x00, 0x18, 0x6e, 0x48, 0x00, 0x00, 0x00, 0x02, 0x6c, 0x09, 0xa0, 0x00, 0xa8,
        0x81, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    const CAPTURE_B: [u8; 26] = [
        0x00, 0x00, 0x1a, 0x00, 0x2f, 0x48, 0x00, 0x00, 0x34, 0x8f, 0x71, 0x09, 0x00, 0x00, 0x00,
        0x00, 0x10, 0x0c, 0x85, 0x09, 0xc0, 0x00, 0xcc, 0x01, 0x00, 0x00,
    ];

    fn beacon_body() -> Vec<u8> {
        let mut frame = vec![0x80, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        frame.extend_from_slice(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&[0x00, 0x04, b't', b'e', b's', b't']);
        frame.extend_from_slice(&[0x03, 0x01, 0x06]);
        frame
    }

    #[test]
    fn test_decode_capture_a() {
        let rt = Radiotap::decode(&CAPTURE_A).unwrap();
        assert_eq!(rt.header.version, 0);
        assert_eq!(rt.presence().value(), 0x0000_486e);
        assert_eq!(rt.fields.len(), 7);

        let channel = rt.channel().unwrap();
        assert_eq!(channel.freq, 0x6c09);
        assert_eq!(channel.flags, 0xa000);

        assert_eq!(rt.rate().unwrap().val, 0x02);
        assert_eq!(rt.antenna_signal().unwrap().db, 0xa8);
        assert_eq!(rt.antenna_noise().unwrap().db, 0x81);
        assert_eq!(rt.antenna().unwrap().index, 0x02);
        assert!(!rt.fcs_present());

        // declared length runs past the capture
        assert!(rt.payload.is_empty());
        assert_eq!(rt.trailer.len(), 5);
    }

    #[test]
    fn test_decode_capture_b_fcs() {
        let rt = Radiotap::decode(&CAPTURE_B).unwrap();
        assert_eq!(rt.header.length, 26);
        assert_eq!(rt.tsft().unwrap().usecs, 0x348f_7109_0000_0000);
        let flags = rt.flags().unwrap();
        assert!(flags.fcs());
        assert_eq!(flags.val & flag_bits::FCS, 0x10);
        assert!(rt.fcs_present());
        assert_eq!(rt.rate().unwrap().val, 0x0c);
        assert_eq!(rt.channel().unwrap().freq, 0x8509);
        assert!(rt.payload.is_empty());
        assert!(rt.trailer.is_empty());
    }

    #[test]
    fn test_reencode_is_byte_exact() {
        for capture in [&CAPTURE_A[..], &CAPTURE_B[..]] {
            let rt = Radiotap::decode(capture).unwrap();
            assert_eq!(&rt.encode().unwrap()[..], capture);
        }
    }

    #[test]
    fn test_fields_in_ascending_order() {
        // Rate (bit 2) and AntennaSignal (bit 5) only
        let buf = [0x00, 0x00, 0x0a, 0x00, 0x24, 0x00, 0x00, 0x00, 0x16, 0xc4];
        let rt = Radiotap::decode(&buf).unwrap();
        let kinds: Vec<_> = rt.fields.iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec![RadiotapField::Rate, RadiotapField::AntennaSignal]);
        assert_eq!(rt.rate().unwrap().val, 0x16);
        assert_eq!(rt.signal_dbm(), Some(-60));
    }

    #[test]
    fn test_single_extension_word() {
        // word 0: Flags + continuation, word 1: nothing
        let buf = [
            0x00, 0x00, 0x0d, 0x00, 0x02, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x12,
        ];
        let rt = Radiotap::decode_raw(&buf).unwrap();
        assert_eq!(rt.extensions, vec![0]);
        assert_eq!(rt.fields.len(), 1);
        assert_eq!(rt.flags().unwrap().val, 0x12);
        assert_eq!(&rt.encode().unwrap()[..], &buf[..]);
    }

    #[test]
    fn test_two_extension_words() {
        let buf = [
            0x00, 0x00, 0x11, 0x00, 0x02, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00,
            0x00, 0x00, 0x21,
        ];
        let rt = Radiotap::decode_raw(&buf).unwrap();
        assert_eq!(rt.extensions.len(), 2);
        assert_eq!(rt.flags().unwrap().val, 0x21);
        assert!(rt.trailer.is_empty());
    }

    #[test]
    fn test_extension_word_shifted_by_eight() {
        // word 1 bit 0 lands on logical bit 8 (TxAttenuation)
        let buf = [
            0x00, 0x00, 0x0e, 0x00, 0x00, 0x00, 0x00, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x07,
        ];
        let rt = Radiotap::decode_raw(&buf).unwrap();
        assert!(rt.is_present(RadiotapField::TxAttenuation));
        assert_eq!(
            rt.field(RadiotapField::TxAttenuation),
            Some(&OptionalField::TxAttenuation(TxAttenuation { val: 7 }))
        );
    }

    #[test]
    fn test_truncated_extension_chain() {
        let buf = [0x00, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00];
        let err = Radiotap::decode(&buf).unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_truncated_fields_and_header() {
        assert!(Radiotap::decode(&CAPTURE_B[..20]).unwrap_err().is_incomplete());
        assert!(Radiotap::decode(&CAPTURE_B[..5]).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_fields_past_declared_length() {
        // declared length 9 but Channel needs 4 bytes after the header
        let buf = [0x00, 0x00, 0x09, 0x00, 0x08, 0x00, 0x00, 0x00, 0x6c, 0x09, 0xa0, 0x00];
        let err = Radiotap::decode(&buf).unwrap_err();
        assert!(matches!(err, SnifferError::MalformedHeader(_)));
    }

    #[test]
    fn test_undecoded_bits_reported() {
        // TX flags (bit 15) plus Flags
        let buf = [0x00, 0x00, 0x0b, 0x00, 0x02, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00];
        let rt = Radiotap::decode_raw(&buf).unwrap();
        assert_eq!(rt.undecoded_bits(), vec![15]);
        assert_eq!(rt.trailer.len(), 2);
    }

    #[test]
    fn test_undecoded_bits_overlapping_words() {
        let mut rt = Radiotap::new();
        rt.header.present = 1 << 31 | 1 << 20 | 1 << 16 | 1 << 1;
        // word 1 bit 8 and word 2 bit 0 both land on logical bit 16
        rt.extensions = vec![1 << 31 | 1 << 13 | 1 << 8, 1 << 2 | 1];
        assert_eq!(rt.undecoded_bits(), vec![16, 18, 20, 21]);
    }

    #[test]
    fn test_flag_setters_preserve_other_bits() {
        let mut flags = Flags { val: 0x10 };
        flags.set_short_preamble(true);
        flags.set_bad_fcs(true);
        assert_eq!(flags.val, 0x52);
        flags.set_short_preamble(false);
        assert!(flags.fcs());
        assert!(flags.bad_fcs());
        assert!(!flags.short_preamble());
        flags.set_cfp(true);
        flags.set_wep(true);
        flags.set_fragmented(true);
        flags.set_data_pad(true);
        flags.set_short_gi(true);
        assert_eq!(flags.val, 0xfd);
        flags.set_wep(false);
        assert_eq!(flags.val, 0xf9);
    }

    #[test]
    fn test_channel_flag_accessors() {
        let channel = Channel {
            freq: 2437,
            flags: channel_flags::SPECTRUM_2GHZ | channel_flags::OFDM,
        };
        assert!(channel.is_2ghz());
        assert!(channel.is_ofdm());
        assert!(!channel.is_5ghz());
        assert!(!channel.is_cck());
    }

    #[test]
    fn test_header_presence_accessors() {
        let mut header = RadiotapHeader::default();
        header.set_present(RadiotapField::Channel, true);
        header.set_present(RadiotapField::Tsft, true);
        assert_eq!(header.present, 0x09);
        header.set_present(RadiotapField::Tsft, false);
        assert!(header.is_present(RadiotapField::Channel));
        assert!(!header.is_present(RadiotapField::Tsft));
        assert!(!header.has_extension());
    }

    #[test]
    fn test_built_frame_roundtrip() {
        let mut rt = Radiotap::new();
        rt.set_field(Channel { freq: 2412, flags: channel_flags::SPECTRUM_2GHZ });
        rt.set_field(Flags::default());
        rt.set_field(AntennaSignal { db: 0xc4 });
        assert_eq!(rt.header.length, 8 + 4 + 1 + 1);
        rt.payload = Payload::from(beacon_body());

        let bytes = rt.encode().unwrap();
        let decoded = Radiotap::decode(&bytes).unwrap();
        assert_eq!(decoded.fields, rt.fields);
        let frame = decoded.mac_frame().unwrap();
        assert_eq!(frame.frame_type, FrameType::Management);
        assert_eq!(frame.subtype, 8);
        assert_eq!(&decoded.encode().unwrap()[..], &bytes[..]);
    }

    #[test]
    fn test_encode_rejects_unflagged_field() {
        let mut rt = Radiotap::new();
        rt.fields.push(OptionalField::Rate(Rate { val: 2 }));
        let err = rt.encode().unwrap_err();
        assert!(matches!(err, SnifferError::UnsupportedField(_)));

        let mut rt = Radiotap::new();
        rt.header.set_present(RadiotapField::Rate, true);
        assert!(matches!(rt.encode(), Err(SnifferError::UnsupportedField(_))));
    }

    #[test]
    fn test_encode_rejects_out_of_order() {
        let mut rt = Radiotap::new();
        rt.set_field(Rate { val: 2 });
        rt.set_field(Flags::default());
        rt.fields.swap(0, 1);
        assert!(matches!(rt.encode(), Err(SnifferError::MalformedHeader(_))));
    }

    #[test]
    fn test_remove_field() {
        let mut rt = Radiotap::decode(&CAPTURE_B).unwrap();
        let removed = rt.remove_field(RadiotapField::Tsft).unwrap();
        assert_eq!(removed.kind(), RadiotapField::Tsft);
        assert_eq!(rt.header.length, 18);
        let again = Radiotap::decode(&rt.encode().unwrap()).unwrap();
        assert_eq!(again.fields, rt.fields);
        assert!(rt.remove_field(RadiotapField::Tsft).is_none());
    }

    #[test]
    fn test_fcs_passed_to_decoder() {
        let mut rt = Radiotap::new();
        rt.set_field(Flags { val: flag_bits::FCS });
        let mut body = beacon_body();
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        rt.payload = Payload::from(body);

        let decoded = Radiotap::decode(&rt.encode().unwrap()).unwrap();
        let frame = decoded.mac_frame().unwrap();
        assert_eq!(frame.ssid(), Some(&b"test"[..]));
        assert_eq!(frame.channel(), Some(6));
    }

    proptest! {
        #[test]
        fn test_base_header_codec(version in any::<u8>(), pad in any::<u8>(), length in any::<u16>(), present in any::<u32>()) {
            assert_codec_roundtrip(&RadiotapHeader { version, pad, length, present });
            assert_codec_roundtrip(&PresenceWord { value: present });
        }

        #[test]
        fn test_optional_field_codecs(
            wide in any::<u64>(),
            a in any::<u16>(),
            b in any::<u16>(),
            x in any::<u8>(),
            y in any::<u8>(),
        ) {
            assert_codec_roundtrip(&Tsft { usecs: wide });
            assert_codec_roundtrip(&Flags { val: x });
            assert_codec_roundtrip(&Rate { val: y });
            assert_codec_roundtrip(&Channel { freq: a, flags: b });
            assert_codec_roundtrip(&Fhss { set: x, pattern: y });
            assert_codec_roundtrip(&AntennaSignal { db: x });
            assert_codec_roundtrip(&AntennaNoise { db: y });
            assert_codec_roundtrip(&LockQuality { val: a });
            assert_codec_roundtrip(&TxAttenuation { val: b });
            assert_codec_roundtrip(&DbTxAttenuation { db: a });
            assert_codec_roundtrip(&DbmTxPower { dbm: x });
            assert_codec_roundtrip(&Antenna { index: y });
            assert_codec_roundtrip(&DbAntennaSignal { db: x });
            assert_codec_roundtrip(&DbAntennaNoise { db: y });
            assert_codec_roundtrip(&RxFlags { val: b });
        }
    }
}
