//! Mach transport: the region lives in pages from `mach_vm_allocate`, the
//! capability is a memory-entry port handed over the bootstrap service.
//! Service registration through `bootstrap_check_in` is exclusive, which is
//! what makes the helper a singleton.

use std::ffi::CString;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use mach::kern_return::KERN_SUCCESS;
use mach::mach_port::{mach_port_allocate, mach_port_deallocate};
use mach::message::{
    MACH_MSG_SUCCESS, MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE,
    MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_MSG_TYPE_PORT_DESCRIPTOR, MACH_RCV_MSG, MACH_RCV_TIMED_OUT,
    MACH_RCV_TIMEOUT, MACH_SEND_MSG, MACH_SEND_TIMEOUT, mach_msg, mach_msg_body_t,
    mach_msg_header_t, mach_msg_port_descriptor_t, mach_msg_trailer_t,
};
use mach::port::{MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE, mach_port_t};
use mach::traps::mach_task_self;
use mach::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_map};
use mach::vm_inherit::VM_INHERIT_NONE;
use mach::vm_prot::{VM_PROT_READ, VM_PROT_WRITE};
use mach::vm_statistics::VM_FLAGS_ANYWHERE;
use mach::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::{info, warn};

use super::{RECEIVE_TIMEOUT, REPLY_TIMEOUT, SEND_TIMEOUT, SERVE_POLL};
use crate::error::HandshakeError;
use crate::shm::{SharedLayout, SharedRegion};
use crate::{MSG_MEMORY_REPLY, MSG_REQUEST_MEMORY, SERVICE_NAME};

// Bootstrap and memory-entry calls the `mach` crate does not bind.
mod ffi {
    use mach::kern_return::kern_return_t;
    use mach::port::mach_port_t;
    use mach::vm_types::mach_vm_address_t;

    pub type MemoryObjectSize = u64;

    unsafe extern "C" {
        pub static bootstrap_port: mach_port_t;
        pub fn bootstrap_check_in(
            bp: mach_port_t,
            service_name: *const libc::c_char,
            sp: *mut mach_port_t,
        ) -> kern_return_t;
        pub fn bootstrap_look_up(
            bp: mach_port_t,
            service_name: *const libc::c_char,
            sp: *mut mach_port_t,
        ) -> kern_return_t;
        pub fn mach_make_memory_entry_64(
            target_task: mach_port_t,
            size: *mut MemoryObjectSize,
            offset: mach_vm_address_t,
            permission: libc::c_int,
            object_handle: *mut mach_port_t,
            parent_entry: mach_port_t,
        ) -> kern_return_t;
    }
}

const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;

fn msgh_bits(remote: u32, local: u32) -> u32 {
    remote | (local << 8)
}

fn page_align(len: usize) -> usize {
    let page = unsafe { mach::vm_page_size::vm_page_size };
    len.div_ceil(page) * page
}

#[repr(C)]
struct RequestMsg {
    header: mach_msg_header_t,
}

#[repr(C)]
struct RequestRecvMsg {
    header: mach_msg_header_t,
    trailer: mach_msg_trailer_t,
}

#[repr(C)]
struct ReplyMsg {
    header: mach_msg_header_t,
    body: mach_msg_body_t,
    memory_port: mach_msg_port_descriptor_t,
    memory_size: u64,
}

#[repr(C)]
struct ReplyRecvMsg {
    reply: ReplyMsg,
    trailer: mach_msg_trailer_t,
}

/// Helper-side server: owns the region pages and the memory-entry port.
pub struct RegionServer {
    service_port: mach_port_t,
    memory_entry: mach_port_t,
    base: mach_vm_address_t,
    size: mach_vm_size_t,
    region: SharedRegion,
}

// Mach ports and the region pages are process-global; the message loop runs
// them from its own thread.
unsafe impl Send for RegionServer {}
unsafe impl Sync for RegionServer {}

impl RegionServer {
    /// Allocate and initialize the region, create the memory entry, and check
    /// the service name in with the bootstrap server.
    pub fn start() -> Result<Self, HandshakeError> {
        let size = page_align(size_of::<SharedLayout>()) as mach_vm_size_t;

        let mut base: mach_vm_address_t = 0;
        let kr = unsafe { mach_vm_allocate(mach_task_self(), &mut base, size, VM_FLAGS_ANYWHERE) };
        if kr != KERN_SUCCESS {
            return Err(HandshakeError::Region(format!("mach_vm_allocate: {kr}")));
        }

        let layout = base as *mut SharedLayout;
        unsafe { (*layout).init() };
        let region = match unsafe { SharedRegion::from_ptr(layout) } {
            Some(region) => region,
            None => {
                unsafe { mach_vm_deallocate(mach_task_self(), base, size) };
                return Err(HandshakeError::Region("null allocation".into()));
            }
        };

        let mut entry_size: ffi::MemoryObjectSize = size;
        let mut memory_entry: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe {
            ffi::mach_make_memory_entry_64(
                mach_task_self(),
                &mut entry_size,
                base,
                VM_PROT_READ | VM_PROT_WRITE,
                &mut memory_entry,
                MACH_PORT_NULL,
            )
        };
        if kr != KERN_SUCCESS {
            unsafe { mach_vm_deallocate(mach_task_self(), base, size) };
            return Err(HandshakeError::Region(format!("mach_make_memory_entry_64: {kr}")));
        }

        let name = CString::new(SERVICE_NAME).map_err(|_| {
            HandshakeError::Registration("service name contains a nul byte".into())
        })?;
        let mut service_port: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe {
            ffi::bootstrap_check_in(ffi::bootstrap_port, name.as_ptr(), &mut service_port)
        };
        if kr != KERN_SUCCESS {
            unsafe {
                mach_port_deallocate(mach_task_self(), memory_entry);
                mach_vm_deallocate(mach_task_self(), base, size);
            }
            return Err(HandshakeError::Registration(format!(
                "bootstrap_check_in: {kr} (is another helper running?)"
            )));
        }

        info!(service = SERVICE_NAME, size, "shared region registered");
        Ok(Self {
            service_port,
            memory_entry,
            base,
            size,
            region,
        })
    }

    /// Handle to the mapped layout. Valid while the server is alive.
    pub fn region(&self) -> SharedRegion {
        self.region
    }

    /// Region size in bytes (page-rounded).
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Answer map requests until `stop` is set; the flag is checked at least
    /// every [`SERVE_POLL`].
    pub fn run_message_loop(&self, stop: &AtomicBool) {
        let mut buf = [0u8; size_of::<RequestRecvMsg>() + 256];

        while !stop.load(Ordering::Relaxed) {
            buf.fill(0);
            let header = buf.as_mut_ptr() as *mut mach_msg_header_t;
            unsafe {
                (*header).msgh_size = buf.len() as u32;
                (*header).msgh_local_port = self.service_port;
            }

            let kr = unsafe {
                mach_msg(
                    header,
                    MACH_RCV_MSG | MACH_RCV_TIMEOUT,
                    0,
                    buf.len() as u32,
                    self.service_port,
                    SERVE_POLL.as_millis() as u32,
                    MACH_PORT_NULL,
                )
            };
            if kr == MACH_RCV_TIMED_OUT {
                continue;
            }
            if kr != MACH_MSG_SUCCESS {
                warn!(kr, "handshake receive failed");
                continue;
            }

            let (id, reply_port) = unsafe { ((*header).msgh_id, (*header).msgh_remote_port) };
            if id as u32 == MSG_REQUEST_MEMORY {
                self.send_reply(reply_port);
            } else {
                warn!(id, "unknown handshake message id");
            }
        }
    }

    fn send_reply(&self, reply_port: mach_port_t) {
        let mut reply: ReplyMsg = unsafe { mem::zeroed() };
        reply.header.msgh_bits =
            msgh_bits(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0) | MACH_MSGH_BITS_COMPLEX;
        reply.header.msgh_size = size_of::<ReplyMsg>() as u32;
        reply.header.msgh_remote_port = reply_port;
        reply.header.msgh_local_port = MACH_PORT_NULL;
        reply.header.msgh_id = MSG_MEMORY_REPLY as i32;

        reply.body.msgh_descriptor_count = 1;
        reply.memory_port.name = self.memory_entry;
        reply.memory_port.disposition = MACH_MSG_TYPE_COPY_SEND as u8;
        reply.memory_port.type_ = MACH_MSG_TYPE_PORT_DESCRIPTOR as u8;
        reply.memory_size = self.size;

        let kr = unsafe {
            mach_msg(
                &mut reply.header,
                MACH_SEND_MSG | MACH_SEND_TIMEOUT,
                size_of::<ReplyMsg>() as u32,
                0,
                MACH_PORT_NULL,
                REPLY_TIMEOUT.as_millis() as u32,
                MACH_PORT_NULL,
            )
        };
        if kr != MACH_MSG_SUCCESS {
            warn!(kr, "failed to send memory reply");
        } else {
            info!("shared region capability sent to plugin");
        }
    }
}

impl Drop for RegionServer {
    fn drop(&mut self) {
        unsafe {
            if self.service_port != MACH_PORT_NULL {
                mach_port_deallocate(mach_task_self(), self.service_port);
            }
            if self.memory_entry != MACH_PORT_NULL {
                mach_port_deallocate(mach_task_self(), self.memory_entry);
            }
            if self.base != 0 {
                mach_vm_deallocate(mach_task_self(), self.base, self.size);
            }
        }
    }
}

/// Plugin-side client holding a non-owning mapping of the helper's region.
pub struct RegionClient {
    mapped: mach_vm_address_t,
    mapped_size: mach_vm_size_t,
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
            mapped: 0,
            mapped_size: 0,
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
    /// read-write shared (not copy-on-write). Idempotent once connected.
    pub fn connect(&mut self) -> Result<SharedRegion, HandshakeError> {
        if let Some(region) = self.region {
            return Ok(region);
        }

        let name = CString::new(SERVICE_NAME).map_err(|_| {
            HandshakeError::Registration("service name contains a nul byte".into())
        })?;
        let mut service_port: mach_port_t = MACH_PORT_NULL;
        let kr =
            unsafe { ffi::bootstrap_look_up(ffi::bootstrap_port, name.as_ptr(), &mut service_port) };
        if kr != KERN_SUCCESS {
            return Err(HandshakeError::ServiceUnavailable);
        }

        let mut reply_port: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe {
            mach_port_allocate(mach_task_self(), MACH_PORT_RIGHT_RECEIVE, &mut reply_port)
        };
        if kr != KERN_SUCCESS {
            unsafe { mach_port_deallocate(mach_task_self(), service_port) };
            return Err(HandshakeError::Region(format!("mach_port_allocate: {kr}")));
        }

        let result = self.exchange(service_port, reply_port);
        unsafe {
            mach_port_deallocate(mach_task_self(), reply_port);
            mach_port_deallocate(mach_task_self(), service_port);
        }
        result
    }

    fn exchange(
        &mut self,
        service_port: mach_port_t,
        reply_port: mach_port_t,
    ) -> Result<SharedRegion, HandshakeError> {
        let mut request: RequestMsg = unsafe { mem::zeroed() };
        request.header.msgh_bits =
            msgh_bits(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE);
        request.header.msgh_size = size_of::<RequestMsg>() as u32;
        request.header.msgh_remote_port = service_port;
        request.header.msgh_local_port = reply_port;
        request.header.msgh_id = MSG_REQUEST_MEMORY as i32;

        let kr = unsafe {
            mach_msg(
                &mut request.header,
                MACH_SEND_MSG | MACH_SEND_TIMEOUT,
                size_of::<RequestMsg>() as u32,
                0,
                MACH_PORT_NULL,
                SEND_TIMEOUT.as_millis() as u32,
                MACH_PORT_NULL,
            )
        };
        if kr != MACH_MSG_SUCCESS {
            return Err(HandshakeError::Timeout);
        }

        let mut buf = [0u8; size_of::<ReplyRecvMsg>() + 256];
        let header = buf.as_mut_ptr() as *mut mach_msg_header_t;
        unsafe {
            (*header).msgh_size = buf.len() as u32;
            (*header).msgh_local_port = reply_port;
        }
        let kr = unsafe {
            mach_msg(
                header,
                MACH_RCV_MSG | MACH_RCV_TIMEOUT,
                0,
                buf.len() as u32,
                reply_port,
                RECEIVE_TIMEOUT.as_millis() as u32,
                MACH_PORT_NULL,
            )
        };
        if kr != MACH_MSG_SUCCESS {
            return Err(HandshakeError::Timeout);
        }

        let reply = unsafe { &*(buf.as_ptr() as *const ReplyMsg) };
        if reply.header.msgh_id as u32 != MSG_MEMORY_REPLY {
            return Err(HandshakeError::Protocol(format!(
                "unexpected reply id {}",
                reply.header.msgh_id
            )));
        }
        let memory_port = reply.memory_port.name;
        let size = reply.memory_size as mach_vm_size_t;
        if (size as usize) < size_of::<SharedLayout>() {
            unsafe { mach_port_deallocate(mach_task_self(), memory_port) };
            return Err(HandshakeError::Protocol(format!("region too small ({size} bytes)")));
        }

        let mut addr: mach_vm_address_t = 0;
        let kr = unsafe {
            mach_vm_map(
                mach_task_self(),
                &mut addr,
                size,
                0,
                VM_FLAGS_ANYWHERE,
                memory_port,
                0,
                0, // share the pages, do not copy
                VM_PROT_READ | VM_PROT_WRITE,
                VM_PROT_READ | VM_PROT_WRITE,
                VM_INHERIT_NONE,
            )
        };
        unsafe { mach_port_deallocate(mach_task_self(), memory_port) };
        if kr != KERN_SUCCESS {
            return Err(HandshakeError::Region(format!("mach_vm_map: {kr}")));
        }

        let region = unsafe { SharedRegion::from_ptr(addr as *mut SharedLayout) }
            .ok_or_else(|| HandshakeError::Region("null mapping".into()))?;

        info!(size, "shared region mapped");
        self.mapped = addr;
        self.mapped_size = size;
        self.region = Some(region);
        Ok(region)
    }

    /// Unmap the region. The helper keeps running; a later connect re-maps.
    pub fn disconnect(&mut self) {
        if self.mapped != 0 {
            unsafe { mach_vm_deallocate(mach_task_self(), self.mapped, self.mapped_size) };
            self.mapped = 0;
            self.mapped_size = 0;
        }
        self.region = None;
    }
}

impl Drop for RegionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
