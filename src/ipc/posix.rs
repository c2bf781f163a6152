//! Unix-domain transport: a memfd region whose descriptor travels over
//! `SCM_RIGHTS`. The socket path derived from the service name plays the
//! role of the capability registry — bind registers (exclusively), connect
//! looks up.

use std::fs::{self, File};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};
use tracing::{info, warn};

use super::{RECEIVE_TIMEOUT, REPLY_TIMEOUT, SEND_TIMEOUT, SERVE_POLL};
use crate::error::HandshakeError;
use crate::shm::{SharedLayout, SharedRegion};
use crate::{MSG_MEMORY_REPLY, MSG_REQUEST_MEMORY, SERVICE_NAME};

fn service_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("{SERVICE_NAME}.sock"))
}

fn page_align(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    len.div_ceil(page) * page
}

fn region_error(context: &str, err: impl std::fmt::Display) -> HandshakeError {
    HandshakeError::Region(format!("{context}: {err}"))
}

/// Helper-side server: owns the shared region and answers map requests.
pub struct RegionServer {
    listener: UnixListener,
    path: PathBuf,
    region: SharedRegion,
    size: usize,
    file: File,
    // Keeps the pages mapped for the server's lifetime.
    _map: MmapMut,
}

impl RegionServer {
    /// Allocate and initialize the region, then register the service name.
    /// Fails when another helper instance already holds the registration.
    pub fn start() -> Result<Self, HandshakeError> {
        let size = page_align(size_of::<SharedLayout>());

        let fd = unsafe { libc::memfd_create(c"driftlink-region".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(region_error("memfd_create", std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)
            .map_err(|err| region_error("truncate", err))?;

        let mut map =
            unsafe { MmapOptions::new().map_mut(&file) }.map_err(|err| region_error("map", err))?;
        // Fresh pages arrive zeroed; init fills in capacities and states.
        let layout = map.as_mut_ptr().cast::<SharedLayout>();
        unsafe { (*layout).init() };
        let region = unsafe { SharedRegion::from_ptr(layout) }
            .ok_or_else(|| HandshakeError::Region("null mapping".into()))?;

        let path = service_path();
        if UnixStream::connect(&path).is_ok() {
            return Err(HandshakeError::Registration(
                "service name already registered (is another helper running?)".into(),
            ));
        }
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        info!(path = %path.display(), size, "shared region registered");
        Ok(Self {
            listener,
            path,
            region,
            size,
            file,
            _map: map,
        })
    }

    /// Handle to the mapped layout. Valid while the server is alive.
    pub fn region(&self) -> SharedRegion {
        self.region
    }

    /// Region size in bytes (page-rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Answer map requests until `stop` is set; the flag is checked at least
    /// every [`SERVE_POLL`].
    pub fn run_message_loop(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.serve(stream) {
                        warn!(%err, "handshake request failed");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(SERVE_POLL);
                }
                Err(err) => {
                    warn!(%err, "handshake accept failed");
                    thread::sleep(SERVE_POLL);
                }
            }
        }
    }

    fn serve(&self, mut stream: UnixStream) -> Result<(), HandshakeError> {
        stream.set_read_timeout(Some(SERVE_POLL))?;
        stream.set_write_timeout(Some(REPLY_TIMEOUT))?;

        let mut request = [0u8; 4];
        stream.read_exact(&mut request)?;
        let id = u32::from_le_bytes(request);
        if id != MSG_REQUEST_MEMORY {
            return Err(HandshakeError::Protocol(format!("unknown message id {id}")));
        }

        let mut reply = [0u8; 12];
        reply[..4].copy_from_slice(&MSG_MEMORY_REPLY.to_le_bytes());
        reply[4..].copy_from_slice(&(self.size as u64).to_le_bytes());

        let iov = [IoSlice::new(&reply)];
        let fds = [self.file.as_raw_fd()];
        let rights = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &rights, MsgFlags::empty(), None)
            .map_err(|err| HandshakeError::Protocol(format!("reply send failed: {err}")))?;

        info!("shared region capability sent to plugin");
        Ok(())
    }
}

impl Drop for RegionServer {
    fn drop(&mut self) {
        // Deregister first; the mapping and the memfd fall with the struct.
        let _ = fs::remove_file(&self.path);
    }
}

/// Plugin-side client holding a non-owning mapping of the helper's region.
pub struct RegionClient {
    map: Option<MmapMut>,
    region: Option<SharedRegion>,
}

impl Default for RegionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionClient {
    /// A disconnected client.
    pub fn new() -> Self {
        Self {
            map: None,
            region: None,
        }
    }

    /// Whether a region is currently mapped.
    pub fn is_connected(&self) -> bool {
        self.region.is_some()
    }

    /// The mapped region, when connected.
    pub fn region(&self) -> Option<SharedRegion> {
        self.region
    }

    /// Look up the service, request the capability, and map the region
    /// read-write shared. Idempotent once connected.
    pub fn connect(&mut self) -> Result<SharedRegion, HandshakeError> {
        if let Some(region) = self.region {
            return Ok(region);
        }

        let mut stream =
            UnixStream::connect(service_path()).map_err(|_| HandshakeError::ServiceUnavailable)?;
        stream.set_write_timeout(Some(SEND_TIMEOUT))?;
        stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        stream
            .write_all(&MSG_REQUEST_MEMORY.to_le_bytes())
            .map_err(map_io_timeout)?;

        let mut reply = [0u8; 12];
        let (bytes, fd) = {
            let mut iov = [IoSliceMut::new(&mut reply)];
            let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
            let received = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            )
            .map_err(map_errno_timeout)?;

            let mut fd = None;
            let cmsgs = received
                .cmsgs()
                .map_err(|err| HandshakeError::Protocol(format!("control data: {err}")))?;
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    fd = fds.first().copied();
                }
            }
            (received.bytes, fd)
        };

        if bytes < reply.len() {
            return Err(HandshakeError::Protocol(format!("short reply ({bytes} bytes)")));
        }
        let id = u32::from_le_bytes(
            reply[..4]
                .try_into()
                .map_err(|_| HandshakeError::Protocol("short reply".into()))?,
        );
        if id != MSG_MEMORY_REPLY {
            return Err(HandshakeError::Protocol(format!("unexpected reply id {id}")));
        }
        let size = u64::from_le_bytes(
            reply[4..]
                .try_into()
                .map_err(|_| HandshakeError::Protocol("short reply".into()))?,
        ) as usize;
        if size < size_of::<SharedLayout>() {
            return Err(HandshakeError::Protocol(format!("region too small ({size} bytes)")));
        }
        let fd = fd.ok_or_else(|| {
            HandshakeError::Protocol("reply carried no memory capability".into())
        })?;

        // The descriptor closes once mapped; the mapping keeps the pages.
        let file = unsafe { File::from_raw_fd(fd) };
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|err| region_error("map", err))?;
        let region = unsafe { SharedRegion::from_ptr(map.as_mut_ptr().cast()) }
            .ok_or_else(|| HandshakeError::Region("null mapping".into()))?;

        info!(size, "shared region mapped");
        self.map = Some(map);
        self.region = Some(region);
        Ok(region)
    }

    /// Unmap the region. The helper keeps running; a later connect re-maps.
    pub fn disconnect(&mut self) {
        self.region = None;
        self.map = None;
    }
}

fn map_io_timeout(err: std::io::Error) -> HandshakeError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => HandshakeError::Timeout,
        _ => HandshakeError::Io(err),
    }
}

fn map_errno_timeout(err: Errno) -> HandshakeError {
    match err {
        Errno::EAGAIN => HandshakeError::Timeout,
        other => HandshakeError::Protocol(format!("reply receive failed: {other}")),
    }
}
