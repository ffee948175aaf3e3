//! Station and access point tracking
//!
//! Every transmitter seen on the air is folded into a fixed array of buckets
//! keyed by MAC address. A MAC appears at most once across the table; seeing
//! it again refreshes the existing record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::ieee80211::MacAddr;

/// Requested bucket count when none is configured
pub const DEFAULT_BUCKETS: usize = 10240;

/// What a tracked address was seen acting as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StationKind {
    AccessPoint,
    Station,
}

impl StationKind {
    /// Wire code used in upstream reports
    pub fn code(self) -> u8 {
        match self {
            StationKind::AccessPoint => 1,
            StationKind::Station => 2,
        }
    }
}

/// One tracked address
#[derive(Debug, Clone, Serialize)]
pub struct StationRecord {
    pub mac: MacAddr,
    pub kind: StationKind,
    /// Monotonic time of the latest observation
    #[serde(skip)]
    pub last_seen: Instant,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Network name, access points only
    pub name: Option<String>,
    pub channel: Option<u8>,
    /// Signal in dBm of the latest observation
    pub signal: Option<i8>,
    pub seen_count: u64,
}

impl StationRecord {
    pub fn new(mac: MacAddr, kind: StationKind) -> Self {
        let now = Utc::now();
        Self {
            mac,
            kind,
            last_seen: Instant::now(),
            first_seen_at: now,
            last_seen_at: now,
            name: None,
            channel: None,
            signal: None,
            seen_count: 1,
        }
    }

    pub fn access_point(mac: MacAddr) -> Self {
        Self::new(mac, StationKind::AccessPoint)
    }

    pub fn station(mac: MacAddr) -> Self {
        Self::new(mac, StationKind::Station)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_signal(mut self, signal: Option<i8>) -> Self {
        self.signal = signal;
        self
    }

    pub fn seen_at(mut self, when: Instant) -> Self {
        self.last_seen = when;
        self
    }

    pub fn is_access_point(&self) -> bool {
        self.kind == StationKind::AccessPoint
    }

    /// Fold a fresh observation of the same address into this record. An
    /// address once seen acting as an access point stays one.
    fn refresh(&mut self, seen: StationRecord) {
        if seen.kind == StationKind::AccessPoint {
            self.kind = StationKind::AccessPoint;
        }
        self.last_seen = seen.last_seen;
        self.last_seen_at = seen.last_seen_at;
        if seen.name.is_some() {
            self.name = seen.name;
        }
        if seen.channel.is_some() {
            self.channel = seen.channel;
        }
        if seen.signal.is_some() {
            self.signal = seen.signal;
        }
        self.seen_count += 1;
    }
}

impl PartialEq for StationRecord {
    fn eq(&self, other: &Self) -> bool {
        self.mac == other.mac
    }
}

impl Eq for StationRecord {}

/// XOR of the address's three big-endian 16-bit words
pub fn mac_hash(mac: &MacAddr) -> u16 {
    let b = mac.as_bytes();
    u16::from_be_bytes([b[0], b[1]]) ^ u16::from_be_bytes([b[2], b[3]]) ^ u16::from_be_bytes([b[4], b[5]])
}

/// Bucketed table of tracked addresses
#[derive(Debug)]
pub struct StationTable {
    buckets: Vec<Vec<StationRecord>>,
    len: usize,
}

impl StationTable {
    /// Create a table with at least `buckets` buckets, rounded up to a
    /// power of two.
    pub fn new(buckets: usize) -> Self {
        let count = buckets.max(1).next_power_of_two();
        Self {
            buckets: vec![Vec::new(); count],
            len: 0,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_of(&self, mac: &MacAddr) -> usize {
        mac_hash(mac) as usize & (self.buckets.len() - 1)
    }

    /// Insert or refresh a record. Returns true when the address is new.
    pub fn insert(&mut self, record: StationRecord) -> bool {
        let index = self.bucket_of(&record.mac);
        let bucket = &mut self.buckets[index];

        if let Some(existing) = bucket.iter_mut().find(|r| r.mac == record.mac) {
            existing.refresh(record);
            return false;
        }

        log::debug!("tracking new {:?} {}", record.kind, record.mac);
        bucket.push(record);
        self.len += 1;
        true
    }

    pub fn get(&self, mac: &MacAddr) -> Option<&StationRecord> {
        self.buckets[self.bucket_of(mac)].iter().find(|r| r.mac == *mac)
    }

    pub fn contains(&self, mac: &MacAddr) -> bool {
        self.get(mac).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &StationRecord> {
        self.buckets.iter().flatten()
    }

    pub fn access_points(&self) -> impl Iterator<Item = &StationRecord> {
        self.iter().filter(|r| r.kind == StationKind::AccessPoint)
    }

    pub fn stations(&self) -> impl Iterator<Item = &StationRecord> {
        self.iter().filter(|r| r.kind == StationKind::Station)
    }
}

impl Default for StationTable {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}
