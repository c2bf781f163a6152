//! Capability handshake bootstrapping the shared region between processes.
//!
//! The helper allocates the region, initializes [`crate::shm::SharedLayout`]
//! in place, and publishes a receive endpoint under [`crate::SERVICE_NAME`].
//! The plugin sends a "request memory" message ([`crate::MSG_REQUEST_MEMORY`])
//! with a reply endpoint attached and receives back
//! ([`crate::MSG_MEMORY_REPLY`]) a capability granting a read-write shared
//! mapping of the same physical pages, plus the region size in bytes.
//!
//! On macOS the capability is a Mach memory-entry port handed over the
//! bootstrap service; on other Unixes it is a memfd passed over a Unix-domain
//! socket with `SCM_RIGHTS`. Message ids, reply shape, and timeouts are
//! identical in both transports, so the protocol-level tests exercise the
//! same handshake everywhere.

use std::time::Duration;

/// Client-side deadline for sending the request.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Client-side deadline for receiving the reply.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Helper-side receive granularity; the stop flag is observed within this.
pub const SERVE_POLL: Duration = Duration::from_millis(500);

/// Helper-side deadline for sending the reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::{RegionClient, RegionServer};

#[cfg(all(unix, not(target_os = "macos")))]
mod posix;
#[cfg(all(unix, not(target_os = "macos")))]
pub use posix::{RegionClient, RegionServer};
