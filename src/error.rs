//! Error types for the `podlinkd` service.
//!
//! Errors are layered the same way the service is: transport failures and
//! protocol failures stay local to one device session, registry failures
//! surface to the D-Bus boundary as plain command failures, and
//! [`AirPodsError`] ties everything together for the rest of the service.

use std::io;

use bluer::Address;
use thiserror::Error;

/// Failures of the L2CAP socket transport.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("Device unreachable: {0}")]
   Unreachable(io::Error),

   #[error("Permission denied opening L2CAP channel")]
   PermissionDenied,

   #[error("Transport operation timed out")]
   Timeout,

   #[error("Write failed: {0}")]
   WriteError(io::Error),

   #[error("Peer closed the connection")]
   PeerClosed,

   #[error("Enhanced retransmission mode unavailable: {0}")]
   ModeUnavailable(String),
}

impl TransportError {
   /// Classifies an I/O error raised while opening a channel.
   pub fn from_open(err: io::Error) -> Self {
      match err.kind() {
         io::ErrorKind::PermissionDenied => Self::PermissionDenied,
         io::ErrorKind::TimedOut => Self::Timeout,
         _ => Self::Unreachable(err),
      }
   }
}

/// Failures of the accessory protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
   #[error("Malformed frame: {reason}")]
   Malformed { reason: &'static str },

   #[error("Unsupported opcode 0x{0:04x}")]
   UnsupportedOpcode(u16),

   #[error("No handshake reply received in time")]
   HandshakeTimeout,
}

impl ProtocolError {
   pub const fn malformed(reason: &'static str) -> Self {
      Self::Malformed { reason }
   }
}

/// Failures of the device registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
   #[error("Unknown device: {0}")]
   UnknownDevice(Address),

   #[error("Already connecting to {0}")]
   AlreadyConnecting(Address),

   #[error("Registry has been shut down")]
   Shutdown,
}

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum AirPodsError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] io::Error),

   #[error(transparent)]
   Transport(#[from] TransportError),

   #[error(transparent)]
   Protocol(#[from] ProtocolError),

   #[error(transparent)]
   Registry(#[from] RegistryError),

   #[error("Device not connected")]
   NotConnected,

   #[error("Session has terminated")]
   SessionClosed,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Bluetooth adapter not available")]
   AdapterNotAvailable,

   #[error("Logger already installed: {0}")]
   Logger(#[from] log::SetLoggerError),
}

/// Convenience type alias for Results with `AirPodsError`.
pub type Result<T> = std::result::Result<T, AirPodsError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn open_errors_are_classified() {
      let denied = io::Error::from(io::ErrorKind::PermissionDenied);
      assert!(matches!(
         TransportError::from_open(denied),
         TransportError::PermissionDenied
      ));

      let timeout = io::Error::from(io::ErrorKind::TimedOut);
      assert!(matches!(TransportError::from_open(timeout), TransportError::Timeout));

      let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
      assert!(matches!(
         TransportError::from_open(refused),
         TransportError::Unreachable(_)
      ));
   }
}
