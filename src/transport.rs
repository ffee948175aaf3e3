//! Upstream reporting
//!
//! Reports go to a collector over TCP as framed messages: a big-endian
//! `CmdHdr` followed by a message specific body. Output is buffered and
//! flushed when the event loop reports the socket writable; WRITE interest
//! is dropped again once the buffer drains.
//!
//! Every report is driven by its own self re-arming loop timer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::daemon::event::{EventLoop, Interest};
use crate::packet::{ByteOrder, Header};
use crate::station::StationRecord;
use crate::{wire_header, Result, SnifferError};

pub const MSG_START_REQ: u32 = 0x0A01;
pub const MSG_START_ACK: u32 = 0x0A02;
pub const MSG_HEARTBEAT_REQ: u32 = 0x0A03;
pub const MSG_KEEP_ALIVE_ACK: u32 = 0x0A04;
pub const MSG_WIFI_MAC_REPORT: u32 = 0x0A05;
pub const MSG_WIFI_MAC_REPORT_ACK: u32 = 0x0A06;
pub const MSG_WIFI_VIR_DATA_REPORT: u32 = 0x0A07;
pub const MSG_RUN_STAT_REPORT: u32 = 0x0A08;
pub const MSG_SET_DATETIME_REQ: u32 = 0x0A10;
pub const MSG_SET_DATETIME_ACK: u32 = 0x0A11;

/// Size of the free-form block in a start request
pub const START_DATA_LEN: usize = 20;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on buffered output; the oldest reports go first
pub const MAX_PENDING: usize = 256 * 1024;
const RECV_CHUNK: usize = 4096;

wire_header! {
    /// Message header; `len` covers header and body
    pub struct CmdHdr(ByteOrder::Big) {
        pub magic_code: u32 = 0,
        pub msg_type: u32 = 0,
        pub len: u32 = 0,
    }
}

wire_header! {
    pub struct MsgStartReq(ByteOrder::Big) {
        pub device_id: u32 = 0,
        pub phy_id: u32 = 0,
        pub version: u16 = 0,
        pub datas: [u8; START_DATA_LEN] = [0; START_DATA_LEN],
    }
}

wire_header! {
    /// Entry count leading a MAC report
    pub struct ReportCount(ByteOrder::Big) {
        pub count: u32 = 0,
    }
}

wire_header! {
    pub struct MacReportEntry(ByteOrder::Big) {
        pub mac: [u8; 6] = [0; 6],
        pub kind: u8 = 0,
        pub channel: u8 = 0,
    }
}

wire_header! {
    pub struct RunStatReport(ByteOrder::Big) {
        pub frames: u32 = 0,
        pub decode_errors: u32 = 0,
        pub access_points: u32 = 0,
        pub stations: u32 = 0,
    }
}

/// Report periods
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportIntervals {
    /// All tracked addresses
    pub mac: Duration,
    pub sta_mac: Duration,
    pub ap_mac: Duration,
    /// Run statistics
    pub vid: Duration,
    pub heartbeat: Duration,
    /// Output housekeeping
    pub period: Duration,
}

impl Default for ReportIntervals {
    fn default() -> Self {
        Self {
            mac: Duration::from_secs(5),
            sta_mac: Duration::from_secs(30),
            ap_mac: Duration::from_secs(30),
            vid: Duration::from_secs(60),
            heartbeat: Duration::from_secs(60),
            period: Duration::from_secs(1),
        }
    }
}

/// Periodic report kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Mac,
    StaMac,
    ApMac,
    Vid,
    Heartbeat,
    Period,
}

impl ReportKind {
    pub const ALL: [ReportKind; 6] = [
        ReportKind::Mac,
        ReportKind::StaMac,
        ReportKind::ApMac,
        ReportKind::Vid,
        ReportKind::Heartbeat,
        ReportKind::Period,
    ];

    pub fn interval(self, intervals: &ReportIntervals) -> Duration {
        match self {
            ReportKind::Mac => intervals.mac,
            ReportKind::StaMac => intervals.sta_mac,
            ReportKind::ApMac => intervals.ap_mac,
            ReportKind::Vid => intervals.vid,
            ReportKind::Heartbeat => intervals.heartbeat,
            ReportKind::Period => intervals.period,
        }
    }
}

/// Frame a message: header with the total length, then the body
pub fn frame_message(magic_code: u32, msg_type: u32, body: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(CmdHdr::encoded_len() + body.len())
        .map_err(|_| SnifferError::InvalidParameter(format!("message body too large: {}", body.len())))?;
    let header = CmdHdr { magic_code, msg_type, len };

    let mut out = BytesMut::with_capacity(len as usize);
    header.pack_into(&mut out)?;
    out.put_slice(body);
    Ok(out.freeze())
}

/// Split one framed message off the front of `buf`
pub fn parse_message(buf: &[u8]) -> Result<(CmdHdr, &[u8], &[u8])> {
    let (header, rest) = CmdHdr::unpack(buf)?;
    let body_len = (header.len as usize)
        .checked_sub(CmdHdr::encoded_len())
        .ok_or_else(|| SnifferError::MalformedHeader(format!("message length {} below header size", header.len)))?;
    if rest.len() < body_len {
        return Err(SnifferError::InsufficientData {
            needed: body_len,
            available: rest.len(),
        });
    }
    let (body, tail) = rest.split_at(body_len);
    Ok((header, body, tail))
}

/// Start request body; `data` is truncated or zero padded to 20 bytes
pub fn start_request(device_id: u32, phy_id: u32, version: u16, data: &[u8]) -> Result<Bytes> {
    let mut datas = [0u8; START_DATA_LEN];
    let n = data.len().min(START_DATA_LEN);
    datas[..n].copy_from_slice(&data[..n]);

    MsgStartReq { device_id, phy_id, version, datas }.to_bytes()
}

/// MAC report body: entry count, then one entry per record
pub fn mac_report<'a>(records: impl IntoIterator<Item = &'a StationRecord>) -> Result<Bytes> {
    let entries: Vec<MacReportEntry> = records
        .into_iter()
        .map(|r| MacReportEntry {
            mac: *r.mac.as_bytes(),
            kind: r.kind.code(),
            channel: r.channel.unwrap_or(0),
        })
        .collect();

    let count = u32::try_from(entries.len())
        .map_err(|_| SnifferError::InvalidParameter("too many report entries".to_string()))?;
    let mut out = BytesMut::with_capacity(
        ReportCount::encoded_len() + entries.len() * MacReportEntry::encoded_len(),
    );
    ReportCount { count }.pack_into(&mut out)?;
    for entry in &entries {
        entry.pack_into(&mut out)?;
    }
    Ok(out.freeze())
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub messages_queued: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    /// Reports discarded because the buffer was full
    pub messages_dropped: u64,
}

/// Buffered connection to the collector
#[derive(Debug)]
pub struct Transport {
    stream: Option<TcpStream>,
    send_buf: BytesMut,
    /// Unsent bytes of each buffered message, oldest first
    queued: VecDeque<usize>,
    /// The oldest message is partly written and must go out whole
    head_started: bool,
    max_pending: usize,
    magic_code: u32,
    intervals: ReportIntervals,
    stats: TransportStats,
}

impl Transport {
    pub fn new(magic_code: u32, intervals: ReportIntervals) -> Self {
        Self {
            stream: None,
            send_buf: BytesMut::new(),
            queued: VecDeque::new(),
            head_started: false,
            max_pending: MAX_PENDING,
            magic_code,
            intervals,
            stats: TransportStats::default(),
        }
    }

    /// Bound buffered output to `max_pending` bytes
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn intervals(&self) -> &ReportIntervals {
        &self.intervals
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Bytes waiting for the socket
    pub fn pending(&self) -> usize {
        self.send_buf.len()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to `server` and switch the socket to non-blocking mode
    pub fn connect(server: &str) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = server
            .to_socket_addrs()
            .map_err(|e| SnifferError::Config(format!("Bad collector address {}: {}", server, e)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    log::info!("Connected to collector {}", addr);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => SnifferError::Io(e),
            None => SnifferError::Config(format!("No address for collector {}", server)),
        })
    }

    /// Adopt a connected stream. The caller registers `fd()` with the loop.
    pub fn attach(&mut self, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Interest the socket needs right now
    pub fn interest(&self) -> Interest {
        if self.send_buf.is_empty() {
            Interest::READ
        } else {
            Interest::READ | Interest::WRITE
        }
    }

    /// Frame and buffer a message, asking the loop for WRITE readiness
    pub fn queue<S>(&mut self, ev: &mut EventLoop<S>, msg_type: u32, body: &[u8]) -> Result<()> {
        let message = frame_message(self.magic_code, msg_type, body)?;
        self.make_room(message.len());
        self.send_buf.extend_from_slice(&message);
        self.queued.push_back(message.len());
        self.stats.messages_queued += 1;

        if let Some(fd) = self.fd() {
            ev.modify(fd, self.interest())?;
        }
        Ok(())
    }

    /// Drop the oldest whole messages until `incoming` more bytes fit
    fn make_room(&mut self, incoming: usize) {
        let keep = if self.head_started {
            self.queued.front().copied().unwrap_or(0)
        } else {
            0
        };
        let first = usize::from(self.head_started);

        let mut dropped_bytes = 0;
        let mut dropped = 0;
        while self.send_buf.len() - dropped_bytes + incoming > self.max_pending {
            match self.queued.remove(first) {
                Some(len) => {
                    dropped_bytes += len;
                    dropped += 1;
                }
                None => break,
            }
        }
        if dropped == 0 {
            return;
        }

        // dropped messages sit right after the kept head
        let mut rest = self.send_buf.split_off(keep);
        rest.advance(dropped_bytes);
        self.send_buf.unsplit(rest);
        self.stats.messages_dropped += dropped;
        log::warn!(
            "Collector is not keeping up, dropped {} queued reports ({} bytes)",
            dropped,
            dropped_bytes
        );
    }

    /// Account for `n` bytes handed to the socket
    fn consume(&mut self, mut n: usize) {
        self.send_buf.advance(n);
        while n > 0 {
            let Some(front) = self.queued.front_mut() else {
                break;
            };
            if *front <= n {
                n -= *front;
                self.queued.pop_front();
                self.head_started = false;
            } else {
                *front -= n;
                n = 0;
                self.head_started = true;
            }
        }
    }

    /// Queue the start request announcing this sensor
    pub fn send_start<S>(&mut self, ev: &mut EventLoop<S>, device_id: u32, phy_id: u32, data: &[u8]) -> Result<()> {
        let body = start_request(device_id, phy_id, 1, data)?;
        self.queue(ev, MSG_START_REQ, &body)
    }

    /// Handle readiness of the collector socket
    pub fn on_ready<S>(&mut self, ev: &mut EventLoop<S>, ready: Interest) -> Result<()> {
        if ready.is_readable() {
            self.read_available(ev)?;
        }
        if ready.is_writable() && self.stream.is_some() {
            self.flush()?;
            if let Some(fd) = self.fd() {
                ev.modify(fd, self.interest())?;
            }
        }
        Ok(())
    }

    fn read_available<S>(&mut self, ev: &mut EventLoop<S>) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let mut buf = [0u8; RECV_CHUNK];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::warn!("Collector closed the connection");
                    self.close(ev);
                    return Ok(());
                }
                Ok(n) => {
                    self.stats.bytes_received += n as u64;
                    log_replies(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(ev);
                    return Err(SnifferError::Io(e));
                }
            }
        }
    }

    /// Write as much buffered output as the socket takes
    pub fn flush(&mut self) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };

        let mut written = 0;
        while written < self.send_buf.len() {
            match stream.write(&self.send_buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.consume(written);
                    self.stats.bytes_sent += written as u64;
                    self.stats.send_errors += 1;
                    return Err(SnifferError::Io(e));
                }
            }
        }
        self.consume(written);
        self.stats.bytes_sent += written as u64;
        Ok(written)
    }

    /// Drop the connection. Whole buffered messages are kept for a later
    /// attach; a partly written one is discarded.
    pub fn close<S>(&mut self, ev: &mut EventLoop<S>) {
        if let Some(stream) = self.stream.take() {
            let _ = ev.unregister(stream.as_raw_fd());
        }
        if self.head_started {
            if let Some(rest) = self.queued.front().copied() {
                self.consume(rest);
            }
        }
    }
}

fn log_replies(mut buf: &[u8]) {
    while !buf.is_empty() {
        match parse_message(buf) {
            Ok((header, body, tail)) => {
                log::debug!("Collector reply 0x{:04x} with {} body bytes", header.msg_type, body.len());
                buf = tail;
            }
            Err(e) => {
                log::debug!("Unparsed collector data ({} bytes): {}", buf.len(), e);
                return;
            }
        }
    }
}
