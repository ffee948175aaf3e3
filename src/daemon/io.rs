//! Sniffer I/O module
//!
//! Raw capture sockets, the local control socket and the non-blocking
//! receive helpers the event loop callbacks use.

use crate::{Result, SnifferError};

use serde::Serialize;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::{Path, PathBuf};

/// Largest control command accepted
pub const MAX_COMMAND_LEN: usize = 1024;

/// Frames taken from one source per readiness callback
pub const DRAIN_BUDGET: usize = 64;

/// Capture statistics of one source
#[derive(Debug, Clone, Default, Serialize)]
pub struct IoStats {
    /// Frames received
    pub frames: u64,
    pub bytes: u64,
    pub recv_errors: u64,
}

/// A non-blocking source of whole link-layer frames
pub trait FrameSource: AsRawFd {
    /// Receive one frame into `buf`
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Raw `AF_PACKET` socket bound to one interface
#[derive(Debug)]
pub struct CaptureSocket {
    fd: OwnedFd,
    ifname: String,
}

impl CaptureSocket {
    /// Open a non-blocking raw socket receiving every protocol on `ifname`
    pub fn open(ifname: &str) -> Result<Self> {
        let name = CString::new(ifname)
            .map_err(|_| SnifferError::InvalidParameter(format!("bad interface name {:?}", ifname)))?;
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(SnifferError::System(format!(
                "Unknown interface {}: {}",
                ifname,
                io::Error::last_os_error()
            )));
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(SnifferError::Io(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = index as libc::c_int;

        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(SnifferError::Io(io::Error::last_os_error()));
        }

        log::info!("Capture socket bound to {} (index {})", ifname, index);
        Ok(Self {
            fd,
            ifname: ifname.to_string(),
        })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }
}

impl AsRawFd for CaptureSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FrameSource for CaptureSocket {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl FrameSource for UnixDatagram {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

/// Receive frames until the source would block or `budget` frames were
/// taken, handing each to `on_frame`. Returns the number of frames received;
/// anything left over is picked up on the next readiness report.
pub fn drain<F>(
    source: &mut dyn FrameSource,
    buf: &mut [u8],
    stats: &mut IoStats,
    budget: usize,
    mut on_frame: F,
) -> Result<usize>
where
    F: FnMut(&[u8]),
{
    let mut frames = 0;
    while frames < budget {
        match source.recv_frame(buf) {
            Ok(n) => {
                frames += 1;
                stats.frames += 1;
                stats.bytes += n as u64;
                on_frame(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(frames),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                stats.recv_errors += 1;
                return Err(SnifferError::Io(e));
            }
        }
    }
    Ok(frames)
}

/// Local datagram socket accepting text commands
#[derive(Debug)]
pub struct ControlSocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind at `path`, replacing a stale socket file
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let socket = UnixDatagram::bind(&path)?;
        socket.set_nonblocking(true)?;
        log::info!("Control interface listening on {}", path.display());
        Ok(Self { socket, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next pending command, if any
    pub fn recv_command(&self) -> Result<Option<(String, SocketAddr)>> {
        let mut buf = [0u8; MAX_COMMAND_LEN];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    return Ok(Some((text, from)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SnifferError::Io(e)),
            }
        }
    }

    /// Send `reply` back to a client. Unbound clients get nothing.
    pub fn reply(&self, to: &SocketAddr, reply: &str) -> Result<bool> {
        let Some(path) = to.as_pathname() else {
            return Ok(false);
        };
        match self.socket.send_to(reply.as_bytes(), path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::warn!("Control client {} is not reading replies", path.display());
                Ok(false)
            }
            Err(e) => Err(SnifferError::Io(e)),
        }
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("airsniff-{}-{}.sock", name, std::process::id()))
    }

    #[test]
    fn test_drain_until_would_block() {
        let (tx, mut rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.send(b"one").unwrap();
        tx.send(b"three").unwrap();

        let mut stats = IoStats::default();
        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        let n = drain(&mut rx, &mut buf, &mut stats, DRAIN_BUDGET, |frame| seen.push(frame.to_vec())).unwrap();

        assert_eq!(n, 2);
        assert_eq!(seen, vec![b"one".to_vec(), b"three".to_vec()]);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.bytes, 8);
    }

    #[test]
    fn test_drain_stops_at_budget() {
        let (tx, mut rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        for _ in 0..5 {
            tx.send(b"frame").unwrap();
        }

        let mut stats = IoStats::default();
        let mut buf = [0u8; 64];
        assert_eq!(drain(&mut rx, &mut buf, &mut stats, 3, |_| {}).unwrap(), 3);
        assert_eq!(drain(&mut rx, &mut buf, &mut stats, 3, |_| {}).unwrap(), 2);
        assert_eq!(drain(&mut rx, &mut buf, &mut stats, 3, |_| {}).unwrap(), 0);
        assert_eq!(stats.frames, 5);
    }

    #[test]
    fn test_control_roundtrip() {
        let server_path = temp_path("ctrl");
        let client_path = temp_path("client");
        let _ = fs::remove_file(&client_path);

        let control = ControlSocket::bind(&server_path).unwrap();
        assert!(control.recv_command().unwrap().is_none());

        let client = UnixDatagram::bind(&client_path).unwrap();
        client.send_to(b"status\n", &server_path).unwrap();

        let (command, from) = control.recv_command().unwrap().unwrap();
        assert_eq!(command, "status");
        assert!(control.reply(&from, "ok").unwrap());

        let mut buf = [0u8; 16];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok");

        drop(control);
        assert!(!server_path.exists());
        let _ = fs::remove_file(&client_path);
    }

    #[test]
    fn test_reply_to_unbound_client_is_skipped() {
        let server_path = temp_path("unbound");
        let control = ControlSocket::bind(&server_path).unwrap();
        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"aps", &server_path).unwrap();

        let (command, from) = control.recv_command().unwrap().unwrap();
        assert_eq!(command, "aps");
        assert!(!control.reply(&from, "[]").unwrap());
    }

    #[test]
    fn test_unknown_interface() {
        let err = CaptureSocket::open("nosuchif0").unwrap_err();
        assert!(matches!(err, SnifferError::System(_)));
    }
}
