//! Sniffer Daemon Core module
//!
//! This module contains the sniffer orchestrator. It owns the event loop and
//! everything the loop callbacks act on: capture workers, the MAC decoder,
//! the tracking table, the channel hopper, the collector transport and the
//! control socket.

use crate::channel::{frequency_to_channel, start_hopping, stop_hopping, ChannelHopper, HopperHost, IwSwitcher};
use crate::ieee80211::{subtype, FrameDecoder, Ieee80211Decoder, MacAddr, MacFrame};
use crate::packet::Header;
use crate::radiotap::Radiotap;
use crate::station::{StationRecord, StationTable};
use crate::transport::{
    mac_report, ReportKind, RunStatReport, Transport, TransportStats, MSG_HEARTBEAT_REQ, MSG_RUN_STAT_REPORT,
    MSG_WIFI_MAC_REPORT,
};
use crate::{Result, SnifferError};

use super::config::{DaemonConfig, TransportConfig};
use super::event::{EventLoop, Interest, LoopStats};
use super::io::{drain, CaptureSocket, ControlSocket, FrameSource, IoStats, DRAIN_BUDGET};

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Instant;

/// Frame processing statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Captures carrying a decoded MAC frame
    pub frames_decoded: u64,
    /// Captures cut short
    pub truncated: u64,
    pub decode_errors: u64,
    /// Captures with an empty payload
    pub empty: u64,
    /// New access points added to the table
    pub access_points_added: u64,
    /// New stations added to the table
    pub stations_added: u64,
    pub control_commands: u64,
}

/// A capture source feeding the loop
struct Worker {
    name: String,
    source: Box<dyn FrameSource>,
    io: IoStats,
}

/// Per-worker status line
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub io: IoStats,
}

/// Reply to the `status` control command
#[derive(Debug, Clone, Serialize)]
pub struct SnifferStatus {
    pub uptime_secs: u64,
    pub workers: Vec<WorkerStatus>,
    pub access_points: usize,
    pub stations: usize,
    pub capture: CaptureStats,
    pub event_loop: LoopStats,
    pub hopping: bool,
    pub channel: Option<u8>,
    pub collector_connected: bool,
    pub transport: Option<TransportStats>,
}

/// State shared by every loop callback
pub struct SnifferContext {
    table: StationTable,
    decoder: Box<dyn FrameDecoder>,
    hopper: Option<ChannelHopper>,
    transport: Option<Transport>,
    control: Option<ControlSocket>,
    signal_pipe: Option<UnixStream>,
    workers: BTreeMap<RawFd, Worker>,
    buf: Vec<u8>,
    stats: CaptureStats,
    started: Instant,
}

impl SnifferContext {
    pub fn table(&self) -> &StationTable {
        &self.table
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn hopper_ref(&self) -> Option<&ChannelHopper> {
        self.hopper.as_ref()
    }

    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }
}

impl HopperHost for SnifferContext {
    fn hopper(&mut self) -> Option<&mut ChannelHopper> {
        self.hopper.as_mut()
    }
}

/// Main sniffer structure
pub struct Sniffer {
    ev: EventLoop<SnifferContext>,
    ctx: SnifferContext,
    signal_ids: Vec<signal_hook::SigId>,
}

impl std::fmt::Debug for Sniffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sniffer")
            .field("event_loop", &self.ev)
            .field("workers", &self.ctx.workers.len())
            .field("tracked", &self.ctx.table.len())
            .field("stats", &self.ctx.stats)
            .finish()
    }
}

impl Sniffer {
    /// Create a sniffer with an empty table and the default MAC decoder
    pub fn new(buckets: usize, snaplen: usize) -> Self {
        Self::with_decoder(buckets, snaplen, Box::new(Ieee80211Decoder))
    }

    pub fn with_decoder(buckets: usize, snaplen: usize, decoder: Box<dyn FrameDecoder>) -> Self {
        Self {
            ev: EventLoop::new(),
            ctx: SnifferContext {
                table: StationTable::new(buckets),
                decoder,
                hopper: None,
                transport: None,
                control: None,
                signal_pipe: None,
                workers: BTreeMap::new(),
                buf: vec![0u8; snaplen],
                stats: CaptureStats::default(),
                started: Instant::now(),
            },
            signal_ids: Vec::new(),
        }
    }

    /// Build a sniffer with every configured component in place
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let mut sniffer = Self::new(config.table.buckets, config.capture.snaplen);

        for ifname in &config.capture.interfaces {
            sniffer.add_worker(ifname)?;
        }

        if config.channels.hopping {
            let switcher = IwSwitcher::for_interfaces(config.capture.interfaces.clone());
            let hopper = ChannelHopper::new(
                config.channels.channels.clone(),
                config.channels.interval(),
                Box::new(switcher),
            )?;
            sniffer.set_hopper(hopper, true);
        }

        if config.control.enabled {
            sniffer.enable_control(&config.control.socket_path)?;
        }

        if config.transport.server.is_some() {
            if let Err(e) = sniffer.connect_transport(&config.transport) {
                log::warn!("Collector unavailable, reporting disabled: {}", e);
            }
        }

        Ok(sniffer)
    }

    pub fn context(&self) -> &SnifferContext {
        &self.ctx
    }

    pub fn event_loop(&self) -> &EventLoop<SnifferContext> {
        &self.ev
    }

    /// Open a capture socket on `ifname` and start reading from it
    pub fn add_worker(&mut self, ifname: &str) -> Result<()> {
        let socket = CaptureSocket::open(ifname)?;
        self.add_source(ifname, Box::new(socket))
    }

    /// Start reading frames from an already open non-blocking source
    pub fn add_source(&mut self, name: &str, source: Box<dyn FrameSource>) -> Result<()> {
        let fd = source.as_raw_fd();
        self.ev.register(fd, Interest::READ, on_capture_ready)?;
        self.ctx.workers.insert(
            fd,
            Worker {
                name: name.to_string(),
                source,
                io: IoStats::default(),
            },
        );
        log::info!("Capture worker {} started", name);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.ctx.workers.len()
    }

    /// Install a hopper, optionally starting it right away
    pub fn set_hopper(&mut self, hopper: ChannelHopper, start: bool) {
        stop_hopping(&mut self.ev, &mut self.ctx);
        self.ctx.hopper = Some(hopper);
        if start {
            start_hopping(&mut self.ev, &mut self.ctx);
        }
    }

    /// Listen for text commands on a Unix datagram socket
    pub fn enable_control(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let control = ControlSocket::bind(path)?;
        self.ev.register(control.as_raw_fd(), Interest::READ, on_control_ready)?;
        self.ctx.control = Some(control);
        Ok(())
    }

    /// Connect to the configured collector and start the report timers
    pub fn connect_transport(&mut self, config: &TransportConfig) -> Result<()> {
        let server = config
            .server
            .as_deref()
            .ok_or_else(|| SnifferError::Config("No collector configured".to_string()))?;
        let stream = Transport::connect(server)?;
        self.attach_transport(stream, config)
    }

    /// Report to the collector over an established connection
    pub fn attach_transport(&mut self, stream: TcpStream, config: &TransportConfig) -> Result<()> {
        if self.ctx.transport.is_some() {
            return Err(SnifferError::Config("Collector transport already attached".to_string()));
        }

        let mut transport = Transport::new(config.magic_code, config.intervals());
        transport.attach(stream)?;
        let fd = transport
            .fd()
            .ok_or_else(|| SnifferError::System("Collector stream has no descriptor".to_string()))?;
        self.ev.register(fd, transport.interest(), on_transport_ready)?;
        transport.send_start(&mut self.ev, config.device_id, config.phy_id, config.start_data.as_bytes())?;

        for kind in ReportKind::ALL {
            let interval = kind.interval(transport.intervals());
            self.ev
                .register_timeout(interval, move |ev, ctx: &mut SnifferContext| on_report_timer(ev, ctx, kind));
        }

        self.ctx.transport = Some(transport);
        Ok(())
    }

    /// Stop the loop on SIGINT or SIGTERM
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            let id = signal_hook::low_level::pipe::register(signal, writer.try_clone()?)
                .map_err(|e| SnifferError::System(format!("Failed to setup signal handler: {}", e)))?;
            self.signal_ids.push(id);
        }

        self.ev.register(reader.as_raw_fd(), Interest::READ, on_signal_ready)?;
        self.ctx.signal_pipe = Some(reader);
        Ok(())
    }

    /// Run a control command as if it arrived on the control socket
    pub fn execute(&mut self, command: &str) -> String {
        handle_command(&mut self.ev, &mut self.ctx, command)
    }

    pub fn status(&self) -> SnifferStatus {
        status_of(&self.ev, &self.ctx)
    }

    /// One loop iteration
    pub fn turn(&mut self) -> Result<()> {
        self.ev.turn(&mut self.ctx)
    }

    /// Run until stopped by a signal, a `stop` command or [`Sniffer::stop`]
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "Sniffer running with {} workers, {} buckets",
            self.ctx.workers.len(),
            self.ctx.table.bucket_count()
        );
        self.ev.run(&mut self.ctx)?;
        log::info!(
            "Sniffer stopped: {} access points, {} stations tracked",
            self.ctx.table.access_points().count(),
            self.ctx.table.stations().count()
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.ev.stop();
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Records to fold into the table for one MAC frame.
///
/// `signal` is attached to the transmitter, `rf_channel` is the capture
/// channel and is used when the frame names none itself. Group addresses
/// are never returned.
pub fn classify(frame: &MacFrame, signal: Option<i8>, rf_channel: Option<u8>) -> Vec<StationRecord> {
    let mut records = Vec::new();
    let mut transmitter = None;

    if let Some(mgmt) = &frame.mgmt {
        transmitter = Some(mgmt.src);
        match frame.subtype {
            subtype::BEACON | subtype::PROBE_RESPONSE => {
                let mut ap = StationRecord::access_point(mgmt.bssid);
                if let Some(name) = frame.ssid_lossy() {
                    ap = ap.with_name(name);
                }
                if let Some(channel) = frame.channel().or(rf_channel) {
                    ap = ap.with_channel(channel);
                }
                records.push(ap);
            }
            subtype::PROBE_REQUEST
            | subtype::ASSOC_REQUEST
            | subtype::REASSOC_REQUEST
            | subtype::AUTHENTICATION => {
                if mgmt.src != mgmt.bssid {
                    records.push(StationRecord::station(mgmt.src));
                    records.push(StationRecord::access_point(mgmt.bssid));
                }
            }
            _ => {}
        }
    } else if let Some(data) = &frame.data {
        match (data.to_ds, data.from_ds) {
            (true, false) => {
                transmitter = Some(data.src);
                records.push(StationRecord::station(data.src));
                records.push(StationRecord::access_point(data.bssid));
            }
            (false, true) => {
                transmitter = Some(data.bssid);
                records.push(StationRecord::station(data.dst));
                records.push(StationRecord::access_point(data.bssid));
            }
            _ => {}
        }
    }

    records
        .into_iter()
        .filter(|r| !r.mac.is_multicast() && r.mac != MacAddr::ZERO)
        .map(|r| {
            let r = match (r.channel, rf_channel) {
                (None, Some(channel)) => r.with_channel(channel),
                _ => r,
            };
            if Some(r.mac) == transmitter {
                r.with_signal(signal)
            } else {
                r
            }
        })
        .collect()
}

/// Decode one capture and fold what it shows into the table
fn process_frame(table: &mut StationTable, decoder: &dyn FrameDecoder, stats: &mut CaptureStats, frame: &[u8]) {
    let radiotap = match Radiotap::decode_with(frame, decoder) {
        Ok(radiotap) => radiotap,
        Err(e) => {
            if e.is_incomplete() {
                stats.truncated += 1;
            } else {
                stats.decode_errors += 1;
            }
            log::debug!("Dropped {} byte capture: {}", frame.len(), e);
            return;
        }
    };

    let Some(mac) = radiotap.mac_frame() else {
        stats.empty += 1;
        return;
    };
    stats.frames_decoded += 1;

    let rf_channel = radiotap.channel().and_then(|c| frequency_to_channel(c.freq));
    for record in classify(mac, radiotap.signal_dbm(), rf_channel) {
        let is_ap = record.is_access_point();
        if table.insert(record) {
            if is_ap {
                stats.access_points_added += 1;
            } else {
                stats.stations_added += 1;
            }
        }
    }
}

fn on_capture_ready(ev: &mut EventLoop<SnifferContext>, ctx: &mut SnifferContext, fd: RawFd, _ready: Interest) {
    let SnifferContext {
        workers,
        table,
        decoder,
        stats,
        buf,
        ..
    } = ctx;
    let Some(worker) = workers.get_mut(&fd) else {
        return;
    };

    let decoder: &dyn FrameDecoder = &**decoder;
    let result = drain(worker.source.as_mut(), buf, &mut worker.io, DRAIN_BUDGET, |frame| {
        process_frame(table, decoder, stats, frame)
    });

    if let Err(e) = result {
        log::error!("Capture on {} failed, stopping worker: {}", worker.name, e);
        let _ = ev.unregister(fd);
        workers.remove(&fd);
    }
}

fn on_control_ready(ev: &mut EventLoop<SnifferContext>, ctx: &mut SnifferContext, _fd: RawFd, _ready: Interest) {
    let mut pending = Vec::new();
    if let Some(control) = ctx.control.as_ref() {
        loop {
            match control.recv_command() {
                Ok(Some(command)) => pending.push(command),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Control socket receive failed: {}", e);
                    break;
                }
            }
        }
    }

    for (command, from) in pending {
        let reply = handle_command(ev, ctx, &command);
        if let Some(control) = ctx.control.as_ref() {
            if let Err(e) = control.reply(&from, &reply) {
                log::warn!("Control reply failed: {}", e);
            }
        }
    }
}

fn on_transport_ready(ev: &mut EventLoop<SnifferContext>, ctx: &mut SnifferContext, _fd: RawFd, ready: Interest) {
    let Some(transport) = ctx.transport.as_mut() else {
        return;
    };
    if let Err(e) = transport.on_ready(ev, ready) {
        log::warn!("Collector connection failed: {}", e);
        transport.close(ev);
    }
}

fn on_signal_ready(ev: &mut EventLoop<SnifferContext>, ctx: &mut SnifferContext, _fd: RawFd, _ready: Interest) {
    if let Some(pipe) = ctx.signal_pipe.as_mut() {
        let mut buf = [0u8; 16];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
    log::info!("Received shutdown signal");
    ev.stop();
}

fn on_report_timer(ev: &mut EventLoop<SnifferContext>, ctx: &mut SnifferContext, kind: ReportKind) {
    let Some(transport) = ctx.transport.as_mut() else {
        return;
    };

    if transport.is_connected() {
        let result = match kind {
            ReportKind::Mac => {
                mac_report(ctx.table.iter()).and_then(|body| transport.queue(ev, MSG_WIFI_MAC_REPORT, &body))
            }
            ReportKind::StaMac => {
                mac_report(ctx.table.stations()).and_then(|body| transport.queue(ev, MSG_WIFI_MAC_REPORT, &body))
            }
            ReportKind::ApMac => mac_report(ctx.table.access_points())
                .and_then(|body| transport.queue(ev, MSG_WIFI_MAC_REPORT, &body)),
            ReportKind::Vid => run_stats(&ctx.table, &ctx.stats)
                .to_bytes()
                .and_then(|body| transport.queue(ev, MSG_RUN_STAT_REPORT, &body)),
            ReportKind::Heartbeat => transport.queue(ev, MSG_HEARTBEAT_REQ, &[]),
            ReportKind::Period if transport.pending() > 0 => transport.on_ready(ev, Interest::WRITE),
            ReportKind::Period => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("{:?} report failed: {}", kind, e);
        }
    }

    let interval = kind.interval(transport.intervals());
    ev.register_timeout(interval, move |ev, ctx: &mut SnifferContext| on_report_timer(ev, ctx, kind));
}

fn run_stats(table: &StationTable, stats: &CaptureStats) -> RunStatReport {
    let clamp = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
    RunStatReport {
        frames: clamp(stats.frames_decoded),
        decode_errors: clamp(stats.decode_errors + stats.truncated),
        access_points: clamp(table.access_points().count() as u64),
        stations: clamp(table.stations().count() as u64),
    }
}

fn status_of(ev: &EventLoop<SnifferContext>, ctx: &SnifferContext) -> SnifferStatus {
    SnifferStatus {
        uptime_secs: ctx.started.elapsed().as_secs(),
        workers: ctx
            .workers
            .values()
            .map(|w| WorkerStatus {
                name: w.name.clone(),
                io: w.io.clone(),
            })
            .collect(),
        access_points: ctx.table.access_points().count(),
        stations: ctx.table.stations().count(),
        capture: ctx.stats.clone(),
        event_loop: ev.stats().clone(),
        hopping: ctx.hopper.as_ref().map(ChannelHopper::is_active).unwrap_or(false),
        channel: ctx.hopper.as_ref().map(ChannelHopper::current),
        collector_connected: ctx.transport.as_ref().map(Transport::is_connected).unwrap_or(false),
        transport: ctx.transport.as_ref().map(|t| t.stats().clone()),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("error: {}", e))
}

fn handle_command(ev: &mut EventLoop<SnifferContext>, ctx: &mut SnifferContext, command: &str) -> String {
    ctx.stats.control_commands += 1;
    log::debug!("Control command: {:?}", command);

    let mut words = command.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("status"), None, None) => to_json(&status_of(ev, ctx)),
        (Some("stations"), None, None) => to_json(&ctx.table.stations().collect::<Vec<_>>()),
        (Some("aps"), None, None) => to_json(&ctx.table.access_points().collect::<Vec<_>>()),
        (Some("hop"), Some("on"), None) => {
            if ctx.hopper.is_none() {
                "error: no channel hopper configured".to_string()
            } else if start_hopping(ev, ctx) {
                "ok".to_string()
            } else {
                "already hopping".to_string()
            }
        }
        (Some("hop"), Some("off"), None) => {
            if stop_hopping(ev, ctx) {
                "ok".to_string()
            } else {
                "not hopping".to_string()
            }
        }
        (Some("stop"), None, None) => {
            log::info!("Stop requested over the control socket");
            ev.stop();
            "stopping".to_string()
        }
        (Some("help"), None, None) => "commands: status, stations, aps, hop on|off, stop".to_string(),
        _ => format!("error: unknown command {:?}", command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSwitcher;
    use crate::ieee80211::{element, MacHeader, TO_DS};
    use crate::radiotap::{AntennaSignal, Channel, RadiotapHeader};
    use crate::transport::{parse_message, MSG_START_REQ};
    use std::cell::{Cell, RefCell};
    use std::net::TcpListener;
    use std::os::unix::net::UnixDatagram;
    use std::rc::Rc;
    use std::time::Duration;

    const AP: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const STA: [u8; 6] = [0x00, 0x1b, 0x63, 0x01, 0x02, 0x03];

    fn mac_frame(fc: u8, flags: u8, addrs: [[u8; 6]; 3], body: &[u8]) -> Vec<u8> {
        let header = MacHeader {
            fc,
            fc_flags: flags,
            addr1: addrs[0],
            addr2: addrs[1],
            addr3: addrs[2],
            ..Default::default()
        };
        let mut frame = header.to_bytes().unwrap().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    fn beacon(ssid: &[u8], channel: u8) -> Vec<u8> {
        let mut body = vec![0u8; 12];
        body.extend_from_slice(&[element::SSID, ssid.len() as u8]);
        body.extend_from_slice(ssid);
        body.extend_from_slice(&[element::DS_PARAMS, 1, channel]);
        mac_frame(subtype::BEACON << 4, 0, [[0xff; 6], AP, AP], &body)
    }

    /// Radiotap capture with no optional fields
    fn capture(mac: &[u8]) -> Vec<u8> {
        let mut out = RadiotapHeader::default().to_bytes().unwrap().to_vec();
        out.extend_from_slice(mac);
        out
    }

    fn decode(mac: &[u8]) -> MacFrame {
        Ieee80211Decoder.decode(mac, false).unwrap()
    }

    #[test]
    fn test_classify_beacon() {
        let records = classify(&decode(&beacon(b"home", 6)), Some(-40), Some(1));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mac, MacAddr(AP));
        assert!(records[0].is_access_point());
        assert_eq!(records[0].name.as_deref(), Some("home"));
        // the DS element wins over the capture channel
        assert_eq!(records[0].channel, Some(6));
        assert_eq!(records[0].signal, Some(-40));
    }

    #[test]
    fn test_classify_probe_request() {
        let frame = mac_frame(subtype::PROBE_REQUEST << 4, 0, [[0xff; 6], STA, [0xff; 6]], &[]);
        let records = classify(&decode(&frame), Some(-70), None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mac, MacAddr(STA));
        assert!(!records[0].is_access_point());
        assert_eq!(records[0].signal, Some(-70));

        let frame = mac_frame(subtype::ASSOC_REQUEST << 4, 0, [AP, STA, AP], &[]);
        let records = classify(&decode(&frame), None, Some(11));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].mac, MacAddr(AP));
        assert!(records[1].is_access_point());
        assert_eq!(records[1].channel, Some(11));
    }

    #[test]
    fn test_classify_data_directions() {
        // station to AP
        let frame = mac_frame(0x08, TO_DS, [AP, STA, [0x00, 0x0c, 0x29, 9, 9, 9]], &[]);
        let records = classify(&decode(&frame), Some(-55), None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mac, MacAddr(STA));
        assert_eq!(records[0].signal, Some(-55));
        assert_eq!(records[1].mac, MacAddr(AP));
        assert_eq!(records[1].signal, None);

        // AP to station
        let frame = mac_frame(0x08, 0x02, [STA, AP, [0x00, 0x0c, 0x29, 9, 9, 9]], &[]);
        let records = classify(&decode(&frame), Some(-30), None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mac, MacAddr(STA));
        assert_eq!(records[1].mac, MacAddr(AP));
        assert_eq!(records[1].signal, Some(-30));

        // IBSS and WDS are ignored
        let frame = mac_frame(0x08, 0x00, [STA, STA, AP], &[]);
        assert!(classify(&decode(&frame), None, None).is_empty());
        let frame = mac_frame(0x08, 0x03, [AP, STA, AP], &[]);
        assert!(classify(&decode(&frame), None, None).is_empty());
    }

    #[test]
    fn test_classify_skips_group_addresses() {
        let frame = mac_frame(0x08, 0x02, [[0xff; 6], AP, STA], &[]);
        let records = classify(&decode(&frame), None, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mac, MacAddr(AP));
    }

    #[test]
    fn test_beacon_through_socket_lands_in_table() {
        let (tx, rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut sniffer = Sniffer::new(64, 2048);
        sniffer.add_source("pair", Box::new(rx)).unwrap();
        assert_eq!(sniffer.worker_count(), 1);

        tx.send(&capture(&beacon(b"cafe", 11))).unwrap();
        tx.send(&capture(&beacon(b"cafe", 11))).unwrap();
        sniffer.turn().unwrap();

        let table = sniffer.context().table();
        assert_eq!(table.len(), 1);
        let ap = table.get(&MacAddr(AP)).unwrap();
        assert!(ap.is_access_point());
        assert_eq!(ap.name.as_deref(), Some("cafe"));
        assert_eq!(ap.channel, Some(11));
        assert_eq!(ap.seen_count, 2);

        let stats = sniffer.context().stats();
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(stats.access_points_added, 1);
    }

    #[test]
    fn test_bad_captures_are_counted_not_fatal() {
        let (tx, rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut sniffer = Sniffer::new(64, 2048);
        sniffer.add_source("pair", Box::new(rx)).unwrap();

        tx.send(&[0x00, 0x00, 0x08]).unwrap();
        tx.send(&capture(&[])).unwrap();
        tx.send(&capture(&[0x80, 0x00, 0x00])).unwrap();
        let mut probe = RadiotapHeader::default();
        probe.length = 4;
        tx.send(&probe.to_bytes().unwrap()).unwrap();
        sniffer.turn().unwrap();

        let stats = sniffer.context().stats();
        assert_eq!(stats.truncated, 2);
        assert_eq!(stats.empty, 1);
        assert_eq!(stats.decode_errors, 1);
        assert!(sniffer.context().table().is_empty());
        assert_eq!(sniffer.worker_count(), 1);
    }

    #[test]
    fn test_signal_and_capture_channel_recorded() {
        let mut radiotap = Radiotap::new();
        radiotap.set_field(Channel { freq: 2437, flags: 0 });
        radiotap.set_field(AntennaSignal { db: (-48i8) as u8 });
        let frame = mac_frame(0x08, TO_DS, [AP, STA, AP], &[]);
        let mut bytes = radiotap.encode().unwrap().to_vec();
        bytes.extend_from_slice(&frame);

        let mut table = StationTable::new(16);
        let mut stats = CaptureStats::default();
        process_frame(&mut table, &Ieee80211Decoder, &mut stats, &bytes);

        let sta = table.get(&MacAddr(STA)).unwrap();
        assert_eq!(sta.signal, Some(-48));
        assert_eq!(sta.channel, Some(6));
        assert_eq!(stats.stations_added, 1);
        assert_eq!(stats.access_points_added, 1);
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<u8>>>);

    impl ChannelSwitcher for Recorder {
        fn switch(&mut self, channel: u8) -> Result<()> {
            self.0.borrow_mut().push(channel);
            Ok(())
        }
    }

    /// Source that never runs dry. The peer keeps one datagram unread so
    /// poll always reports the socket readable.
    struct Flood {
        socket: UnixDatagram,
        _peer: UnixDatagram,
        frame: Vec<u8>,
        served: Rc<Cell<usize>>,
    }

    impl AsRawFd for Flood {
        fn as_raw_fd(&self) -> RawFd {
            self.socket.as_raw_fd()
        }
    }

    impl FrameSource for Flood {
        fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.served.set(self.served.get() + 1);
            buf[..self.frame.len()].copy_from_slice(&self.frame);
            Ok(self.frame.len())
        }
    }

    #[test]
    fn test_busy_source_does_not_starve_timers() {
        let (socket, peer) = UnixDatagram::pair().unwrap();
        peer.send(b"x").unwrap();
        let served = Rc::new(Cell::new(0));
        let flood = Flood {
            socket,
            _peer: peer,
            frame: capture(&beacon(b"busy", 1)),
            served: served.clone(),
        };

        let recorder = Recorder::default();
        let hopper = ChannelHopper::new(vec![1, 6], Duration::from_millis(1), Box::new(recorder.clone())).unwrap();
        let mut sniffer = Sniffer::new(64, 2048);
        sniffer.set_hopper(hopper, true);
        sniffer.add_source("flood", Box::new(flood)).unwrap();

        sniffer.turn().unwrap();
        assert_eq!(served.get(), DRAIN_BUDGET);

        std::thread::sleep(Duration::from_millis(5));
        sniffer.turn().unwrap();
        assert_eq!(served.get(), 2 * DRAIN_BUDGET);
        assert!(!recorder.0.borrow().is_empty());
        assert_eq!(sniffer.context().table().len(), 1);
    }

    #[test]
    fn test_control_commands() {
        let mut sniffer = Sniffer::new(16, 256);
        assert!(sniffer.execute("hop on").starts_with("error"));

        let recorder = Recorder::default();
        let hopper = ChannelHopper::new(vec![1, 6, 11], Duration::from_secs(60), Box::new(recorder)).unwrap();
        sniffer.set_hopper(hopper, false);

        assert_eq!(sniffer.execute("hop on"), "ok");
        assert_eq!(sniffer.execute("hop on"), "already hopping");
        assert!(sniffer.status().hopping);
        assert_eq!(sniffer.execute("hop off"), "ok");
        assert_eq!(sniffer.execute("hop off"), "not hopping");

        assert_eq!(sniffer.execute("aps"), "[]");
        let status: serde_json::Value = serde_json::from_str(&sniffer.execute("status")).unwrap();
        assert_eq!(status["channel"], 1);
        assert_eq!(status["hopping"], false);
        assert!(sniffer.execute("bogus").starts_with("error"));

        assert_eq!(sniffer.execute("stop"), "stopping");
        assert!(!sniffer.event_loop().is_running());
        assert_eq!(sniffer.context().stats().control_commands, 9);
    }

    #[test]
    fn test_stations_listing() {
        let (tx, rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut sniffer = Sniffer::new(64, 2048);
        sniffer.add_source("pair", Box::new(rx)).unwrap();

        tx.send(&capture(&mac_frame(0x08, TO_DS, [AP, STA, AP], &[]))).unwrap();
        sniffer.turn().unwrap();

        let stations: serde_json::Value = serde_json::from_str(&sniffer.execute("stations")).unwrap();
        assert_eq!(stations[0]["mac"], "00:1b:63:01:02:03");
        assert_eq!(stations[0]["kind"], "station");
        let aps: serde_json::Value = serde_json::from_str(&sniffer.execute("aps")).unwrap();
        assert_eq!(aps[0]["mac"], "02:11:22:33:44:55");
    }

    #[test]
    fn test_control_socket_roundtrip() {
        let dir = std::env::temp_dir();
        let server = dir.join(format!("airsniff-core-{}.sock", std::process::id()));
        let client_path = dir.join(format!("airsniff-core-client-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&client_path);

        let mut sniffer = Sniffer::new(16, 256);
        sniffer.enable_control(&server).unwrap();

        let client = UnixDatagram::bind(&client_path).unwrap();
        client.send_to(b"aps\n", &server).unwrap();
        sniffer.turn().unwrap();

        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"[]");

        client.send_to(b"stop", &server).unwrap();
        sniffer.run().unwrap();
        assert!(!sniffer.event_loop().is_running());
        let _ = std::fs::remove_file(&client_path);
    }

    #[test]
    fn test_transport_sends_start_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let config = TransportConfig {
            server: Some(listener.local_addr().unwrap().to_string()),
            magic_code: 0x5a5a,
            device_id: 9,
            ..Default::default()
        };

        let mut sniffer = Sniffer::new(16, 256);
        sniffer.attach_transport(stream.try_clone().unwrap(), &config).unwrap();
        assert!(sniffer.attach_transport(stream, &config).is_err());
        assert!(sniffer.status().collector_connected);

        sniffer.turn().unwrap();
        assert_eq!(sniffer.context().transport().unwrap().pending(), 0);

        let mut buf = [0u8; 42];
        peer.read_exact(&mut buf).unwrap();
        let (header, body, tail) = parse_message(&buf).unwrap();
        assert_eq!(header.magic_code, 0x5a5a);
        assert_eq!(header.msg_type, MSG_START_REQ);
        assert_eq!(&body[..4], &[0, 0, 0, 9]);
        assert!(tail.is_empty());
    }
}
