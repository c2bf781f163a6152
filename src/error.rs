//! Error enumerations surfaced across the crate's public API.
//!
//! Ring underrun/overrun and drift-tracker warmup are deliberately absent:
//! those are expected conditions handled inline (silence or dropped blocks),
//! never errors.

use thiserror::Error;

/// Failures of the capability handshake between plugin and helper.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The well-known service is not registered — the helper is not running.
    #[error("helper not running")]
    ServiceUnavailable,
    /// A send or receive exceeded its deadline. Reported to the plugin host
    /// the same as [`Self::ServiceUnavailable`].
    #[error("handshake timed out")]
    Timeout,
    /// The peer spoke the protocol wrong (bad message id, missing capability).
    #[error("malformed handshake message: {0}")]
    Protocol(String),
    /// Allocating, truncating, or mapping the shared region failed.
    #[error("shared region setup failed: {0}")]
    Region(String),
    /// Registering the service name failed (usually another helper instance).
    #[error("service registration failed: {0}")]
    Registration(String),
    /// Transport-level I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Whether the plugin should report this as "helper not running".
    pub fn is_helper_absent(&self) -> bool {
        matches!(self, Self::ServiceUnavailable | Self::Timeout)
    }
}

/// Failures raised while starting or running the helper engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A main-path resampler could not be built. Fatal: aborts start. (The
    /// cue resampler failing is handled inline and is non-fatal.)
    #[error("resampler creation failed: {0}")]
    ResamplerCreation(String),
    /// A device UID did not resolve or the device refused to open. Non-fatal
    /// at the engine level; the path serves silence until the device appears.
    #[error("device open failed for '{0}'")]
    DeviceOpen(String),
    /// `start` called on an engine that is already running.
    #[error("engine already running")]
    AlreadyRunning,
    /// Handshake machinery failed while bootstrapping the shared region.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}
