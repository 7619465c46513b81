//! Bluetooth layer.
//!
//! L2CAP sockets, the connector seam sessions open links through, and
//! discovery of connected accessories on the BlueZ adapter.

pub mod discovery;
pub mod l2cap;
pub mod transport;
